//! Client environment variables as graph inputs.

use crate::differencer::Injectable;
use crate::error::FunctionError;
use crate::function::{Computed, Env, SkyFunction};
use crate::key::{Arg, Key};
use crate::value::Value;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// The environment of the client that issued the current command.  Shared
/// between the engine, which replaces it on every sync, and the function
/// that reads it.
#[derive(Clone, Debug, Default)]
pub struct ClientEnvironment(Arc<RwLock<BTreeMap<String, String>>>);

impl ClientEnvironment {
    pub fn new() -> Self {
        ClientEnvironment::default()
    }

    pub fn set(&self, vars: BTreeMap<String, String>) {
        *self.0.write() = vars;
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.0.read().get(name).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.0.read().clone()
    }
}

/// Computes `CLIENT_ENVIRONMENT_VARIABLE(name)`.
pub struct ClientEnvironmentFunction {
    env: ClientEnvironment,
}

impl ClientEnvironmentFunction {
    pub fn new(env: ClientEnvironment) -> Self {
        ClientEnvironmentFunction { env }
    }
}

impl SkyFunction for ClientEnvironmentFunction {
    fn compute(&self, key: &Key, _env: &mut Env<'_>) -> Result<Computed, FunctionError> {
        let name = match key.arg() {
            Arg::Str(name) => name,
            arg => {
                return Err(FunctionError::failed(format!(
                    "{} is not a variable name",
                    arg
                )))
            }
        };
        let value = self.env.get(name).map(Arc::from);
        Ok(Computed::Done(Value::ClientEnv(value)))
    }
}

/// Remembers which variables the previous command had.
#[derive(Debug, Default)]
pub struct ClientEnv {
    previous: BTreeSet<String>,
}

impl ClientEnv {
    pub fn new() -> Self {
        ClientEnv::default()
    }

    /// Queues the changes between the previous command's environment and
    /// `env`.  Removed variables are invalidated; every current variable is
    /// injected, which is a no-op for the unchanged ones.
    pub fn handle_changes(&mut self, env: &BTreeMap<String, String>, differencer: &dyn Injectable) {
        let mut removed = self
            .previous
            .iter()
            .filter(|name| !env.contains_key(*name))
            .map(|name| Key::client_environment_variable(name));
        differencer.invalidate(&mut removed);
        let mut current = env.iter().map(|(name, value)| {
            (
                Key::client_environment_variable(name),
                Value::ClientEnv(Some(Arc::from(value.as_str()))),
            )
        });
        differencer.inject(&mut current);
        self.previous = env.keys().cloned().collect();
    }

    pub fn reset(&mut self) {
        self.previous.clear();
    }
}
