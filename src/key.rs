//! Keys, the only handles into the graph.
//!
//! A key pairs a computation kind (a `FunctionName`) with an argument.  Keys
//! are cheap to clone; strings and paths inside them are reference counted.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Names a kind of computation, e.g. `FILE_STATE`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FunctionName(&'static str);

impl FunctionName {
    pub const FILE_STATE: FunctionName = FunctionName("FILE_STATE");
    pub const DIRECTORY_LISTING_STATE: FunctionName = FunctionName("DIRECTORY_LISTING_STATE");
    pub const CLIENT_ENVIRONMENT_VARIABLE: FunctionName =
        FunctionName("CLIENT_ENVIRONMENT_VARIABLE");

    pub const fn new(name: &'static str) -> Self {
        FunctionName(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// An absolute directory that anchors rooted paths, e.g. a package root.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Root(Arc<Path>);

impl Root {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Root(Arc::from(path.into().as_path()))
    }

    /// The filesystem root, used for paths that live outside every package root.
    pub fn absolute() -> Self {
        Root::new(std::path::MAIN_SEPARATOR.to_string())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.0)
    }
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.display())
    }
}

/// Lexically normalize a relative path: drops "." components and resolves
/// ".." against preceding components.  Leading ".." components are kept.
fn normalize(rel: &Path) -> PathBuf {
    let mut parts: Vec<Component> = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                _ => parts.push(comp),
            },
            Component::RootDir | Component::Prefix(_) => {}
            Component::Normal(_) => parts.push(comp),
        }
    }
    parts.iter().collect()
}

/// A path split into the root it lives under and the path relative to it.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct RootedPath {
    root: Root,
    rel: Arc<Path>,
}

impl RootedPath {
    pub fn new(root: Root, rel: impl AsRef<Path>) -> Self {
        let rel = normalize(rel.as_ref());
        RootedPath {
            root,
            rel: Arc::from(rel.as_path()),
        }
    }

    /// Roots an absolute path under the filesystem root.
    pub fn absolute(path: impl AsRef<Path>) -> Self {
        RootedPath::new(Root::absolute(), path)
    }

    pub fn root(&self) -> &Root {
        &self.root
    }

    pub fn relative(&self) -> &Path {
        &self.rel
    }

    pub fn as_path(&self) -> PathBuf {
        self.root.path().join(&self.rel)
    }

    /// The rooted path of the containing directory, or None at the root.
    pub fn parent(&self) -> Option<RootedPath> {
        let parent = self.rel.parent()?;
        Some(RootedPath {
            root: self.root.clone(),
            rel: Arc::from(parent),
        })
    }
}

impl fmt::Display for RootedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.root, self.rel.display())
    }
}

/// The argument half of a key.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Arg {
    Unit,
    Int(i64),
    Str(Arc<str>),
    Path(RootedPath),
    Tuple(Arc<[Arg]>),
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Unit => f.write_str("()"),
            Arg::Int(n) => write!(f, "{}", n),
            Arg::Str(s) => write!(f, "{:?}", s),
            Arg::Path(p) => write!(f, "{}", p),
            Arg::Tuple(args) => {
                f.write_str("(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Str(Arc::from(s))
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Str(Arc::from(s))
    }
}

impl From<i64> for Arg {
    fn from(n: i64) -> Self {
        Arg::Int(n)
    }
}

impl From<RootedPath> for Arg {
    fn from(p: RootedPath) -> Self {
        Arg::Path(p)
    }
}

/// Identifies one unit of computation in the graph.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Key {
    function: FunctionName,
    arg: Arg,
}

impl Key {
    pub fn new(function: FunctionName, arg: impl Into<Arg>) -> Self {
        Key {
            function,
            arg: arg.into(),
        }
    }

    pub fn function(&self) -> FunctionName {
        self.function
    }

    pub fn arg(&self) -> &Arg {
        &self.arg
    }

    /// The rooted path argument, if this key has one.
    pub fn path(&self) -> Option<&RootedPath> {
        match &self.arg {
            Arg::Path(p) => Some(p),
            _ => None,
        }
    }

    pub fn file_state(path: RootedPath) -> Self {
        Key::new(FunctionName::FILE_STATE, path)
    }

    pub fn directory_listing_state(path: RootedPath) -> Self {
        Key::new(FunctionName::DIRECTORY_LISTING_STATE, path)
    }

    pub fn client_environment_variable(name: &str) -> Self {
        Key::new(FunctionName::CLIENT_ENVIRONMENT_VARIABLE, name)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.function, self.arg)
    }
}
