//! Timestamp granularity monitoring.
//!
//! A file modified in the same clock tick as the start of a command may get
//! modified again before the end of that tick, leaving its mtime unchanged.
//! The monitor notices when the current command read such a file and, at the
//! end of the command, waits out the tick so the next change is observable.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Default, Debug)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}

fn millis(t: SystemTime) -> u128 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

pub struct TimestampGranularityMonitor {
    clock: Arc<dyn Clock>,
    command_start: Mutex<Option<SystemTime>>,
    wait_a_millisecond: AtomicBool,
    wait_a_second: AtomicBool,
}

impl TimestampGranularityMonitor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        TimestampGranularityMonitor {
            clock,
            command_start: Mutex::new(None),
            wait_a_millisecond: AtomicBool::new(false),
            wait_a_second: AtomicBool::new(false),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn set_command_start_time(&self) {
        *self.command_start.lock() = Some(self.clock.now());
        self.wait_a_millisecond.store(false, Ordering::Relaxed);
        self.wait_a_second.store(false, Ordering::Relaxed);
    }

    /// Records that the current command depends on a file with the given
    /// mtime.
    pub fn notify_dependence_on_file_time(&self, mtime: SystemTime) {
        let start = match *self.command_start.lock() {
            Some(start) => millis(start),
            None => return,
        };
        let mtime = millis(mtime);
        if mtime == start {
            self.wait_a_millisecond.store(true, Ordering::Relaxed);
        }
        // An mtime exactly on a second boundary suggests a file system with
        // one second granularity.
        if mtime % 1000 == 0 && mtime / 1000 == start / 1000 {
            self.wait_a_second.store(true, Ordering::Relaxed);
        }
    }

    pub fn wait_needed(&self) -> bool {
        self.wait_a_millisecond.load(Ordering::Relaxed) || self.wait_a_second.load(Ordering::Relaxed)
    }

    /// Sleeps until a modification made now would get an mtime distinct from
    /// any mtime noted during this command.
    pub fn wait_for_timestamp_granularity(&self) {
        let start = match *self.command_start.lock() {
            Some(start) => millis(start),
            None => return,
        };
        let until = if self.wait_a_second.load(Ordering::Relaxed) {
            (start / 1000 + 1) * 1000
        } else if self.wait_a_millisecond.load(Ordering::Relaxed) {
            start + 1
        } else {
            return;
        };
        let now = millis(self.clock.now());
        if now < until {
            let wait = Duration::from_millis((until - now) as u64);
            tracing::debug!("waiting {:?} for timestamp granularity", wait);
            std::thread::sleep(wait);
        }
    }
}
