//! Chrome trace output.
//!
//! Scopes may be entered from any thread; each event carries the id of the
//! thread that recorded it.

use parking_lot::Mutex;
use std::cell::Cell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

static ENABLED: AtomicBool = AtomicBool::new(false);
static TRACE: Mutex<Option<Trace>> = parking_lot::const_mutex(None);

fn thread_id() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static ID: Cell<Option<usize>> = Cell::new(None);
    }
    ID.with(|id| match id.get() {
        Some(n) => n,
        None => {
            let n = NEXT.fetch_add(1, Ordering::Relaxed);
            id.set(Some(n));
            n
        }
    })
}

struct Event {
    name: &'static str,
    tid: usize,
    start: Instant,
    end: Instant,
}

struct Trace {
    start: Instant,
    w: BufWriter<File>,
}

impl Trace {
    fn new(path: &str) -> std::io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
        })
    }

    fn write_event(&mut self, event: &Event) -> std::io::Result<()> {
        write!(
            self.w,
            "{{ \"pid\": 0, \"tid\": {}, \"name\": {:?}, \"ts\": {}, \"ph\": \"X\", \"dur\": {} }}",
            event.tid,
            event.name,
            event.start.duration_since(self.start).as_micros(),
            event.end.duration_since(event.start).as_micros(),
        )
    }

    fn write(&mut self, event: &Event) -> std::io::Result<()> {
        self.write_event(event)?;
        writeln!(self.w, ",")
    }

    fn close(&mut self) -> std::io::Result<()> {
        let main = Event {
            name: "main",
            tid: thread_id(),
            start: self.start,
            end: Instant::now(),
        };
        self.write_event(&main)?;
        writeln!(self.w, "]")?;
        self.w.flush()
    }
}

pub fn open(path: &str) -> std::io::Result<()> {
    let trace = Trace::new(path)?;
    *TRACE.lock() = Some(trace);
    ENABLED.store(true, Ordering::SeqCst);
    Ok(())
}

#[inline]
pub fn scope<T>(name: &'static str, f: impl FnOnce() -> T) -> T {
    if !ENABLED.load(Ordering::Relaxed) {
        return f();
    }
    let start = Instant::now();
    let result = f();
    let event = Event {
        name,
        tid: thread_id(),
        start,
        end: Instant::now(),
    };
    if let Some(trace) = TRACE.lock().as_mut() {
        if let Err(err) = trace.write(&event) {
            tracing::warn!("writing trace: {}", err);
        }
    }
    result
}

pub fn close() -> std::io::Result<()> {
    ENABLED.store(false, Ordering::SeqCst);
    match TRACE.lock().take() {
        Some(mut trace) => trace.close(),
        None => Ok(()),
    }
}
