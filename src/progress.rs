//! Evaluation progress tracking and reporting, for the purpose of display to
//! the user.

use crate::error::ErrorInfo;
use crate::evaluator::EvaluationStats;
use crate::key::Key;
use parking_lot::Mutex;
use std::io::Write;

/// Trait for evaluation progress notifications.  Called from evaluation
/// worker threads, so implementations synchronize internally.
pub trait EvaluationProgress: Send + Sync {
    /// Called once per evaluation before any node is processed.
    fn evaluation_started(&self, roots: &[Key]);

    /// Called when a computation finished with a value.
    fn node_built(&self, key: &Key);

    /// Called when a dirty node was verified clean without recomputing.
    fn node_confirmed(&self, key: &Key);

    fn node_failed(&self, key: &Key, err: &ErrorInfo);

    /// Called when a computation needs to run again for missing deps.
    fn node_restarted(&self, key: &Key);

    fn evaluation_finished(&self, stats: &EvaluationStats);

    /// Log a line of output without corrupting the progress display.
    fn log(&self, msg: &str);
}

/// Progress sink that ignores everything.
#[derive(Default, Debug)]
pub struct NullProgress;

impl EvaluationProgress for NullProgress {
    fn evaluation_started(&self, _roots: &[Key]) {}
    fn node_built(&self, _key: &Key) {}
    fn node_confirmed(&self, _key: &Key) {}
    fn node_failed(&self, _key: &Key, _err: &ErrorInfo) {}
    fn node_restarted(&self, _key: &Key) {}
    fn evaluation_finished(&self, _stats: &EvaluationStats) {}
    fn log(&self, _msg: &str) {}
}

#[cfg(unix)]
fn stdout_is_terminal() -> bool {
    // Safety: isatty only inspects the descriptor.
    unsafe { libc::isatty(/* stdout */ 1) == 1 }
}

#[cfg(windows)]
fn stdout_is_terminal() -> bool {
    use windows_sys::Win32::System::Console::*;
    // Safety: plain console queries on our own stdout handle.
    unsafe {
        let handle = GetStdHandle(STD_OUTPUT_HANDLE);
        let mut mode = 0;
        // GetConsoleMode fails when not attached to a console.
        if GetConsoleMode(handle, &mut mode) == 0 {
            return false;
        }
        // Enable terminal processing so we can overwrite previous content.
        _ = SetConsoleMode(handle, mode | ENABLE_VIRTUAL_TERMINAL_PROCESSING);
        true
    }
}

#[cfg(not(any(unix, windows)))]
fn stdout_is_terminal() -> bool {
    false
}

/// Whether stdout supports overprinting a status line.
pub fn use_fancy() -> bool {
    stdout_is_terminal()
}

#[derive(Default)]
struct ConsoleState {
    built: usize,
    confirmed: usize,
    /// Whether a status line is currently displayed.
    status_shown: bool,
}

/// Progress implementation for the console.  In "fancy" mode a single status
/// line is overprinted as nodes finish; otherwise only failures (and, with
/// verbose, every computed key) are printed.
pub struct ConsoleProgress {
    verbose: bool,
    fancy: bool,
    state: Mutex<ConsoleState>,
}

impl ConsoleProgress {
    pub fn new(verbose: bool, fancy: bool) -> Self {
        ConsoleProgress {
            verbose,
            fancy,
            state: Mutex::new(ConsoleState::default()),
        }
    }

    fn clear_status(&self, state: &mut ConsoleState) {
        if state.status_shown {
            // \r to go to the first column, then clear to the end of line.
            print!("\r\x1b[K");
            state.status_shown = false;
        }
    }

    fn print_line(&self, state: &mut ConsoleState, msg: &str) {
        self.clear_status(state);
        println!("{}", msg);
    }

    fn print_status(&self, state: &mut ConsoleState, key: &Key) {
        if !self.fancy {
            return;
        }
        print!(
            "\r\x1b[K[{} computed, {} up to date] {}",
            state.built, state.confirmed, key
        );
        let _ = std::io::stdout().flush();
        state.status_shown = true;
    }
}

impl EvaluationProgress for ConsoleProgress {
    fn evaluation_started(&self, _roots: &[Key]) {
        let mut state = self.state.lock();
        state.built = 0;
        state.confirmed = 0;
    }

    fn node_built(&self, key: &Key) {
        let mut state = self.state.lock();
        state.built += 1;
        if self.verbose {
            self.print_line(&mut state, &format!("computed {}", key));
        }
        self.print_status(&mut state, key);
    }

    fn node_confirmed(&self, key: &Key) {
        let mut state = self.state.lock();
        state.confirmed += 1;
        self.print_status(&mut state, key);
    }

    fn node_failed(&self, key: &Key, err: &ErrorInfo) {
        let mut state = self.state.lock();
        self.print_line(&mut state, &format!("failed: {}: {}", key, err));
    }

    fn node_restarted(&self, _key: &Key) {
        // ignore
    }

    fn evaluation_finished(&self, _stats: &EvaluationStats) {
        let mut state = self.state.lock();
        self.clear_status(&mut state);
        let _ = std::io::stdout().flush();
    }

    fn log(&self, msg: &str) {
        let mut state = self.state.lock();
        self.print_line(&mut state, msg);
    }
}
