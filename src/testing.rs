//! Log capture for unit tests.
//!
//! Installs a process-wide logger once and counts records per thread, so
//! tests running in parallel (each on its own current-thread runtime) only
//! see what they logged themselves.

use std::cell::Cell;
use std::sync::Once;

use log::{Level, LevelFilter, Log, Metadata, Record};

static INIT: Once = Once::new();
static LOGGER: CountingLogger = CountingLogger;

thread_local! {
    static WARNINGS: Cell<usize> = const { Cell::new(0) };
}

struct CountingLogger;

impl Log for CountingLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        if record.level() == Level::Warn {
            WARNINGS.with(|count| count.set(count.get() + 1));
        }
    }

    fn flush(&self) {}
}

/// Handle for reading this thread's captured log counts.
#[derive(Debug)]
pub(crate) struct CapturedLogs;

impl CapturedLogs {
    /// Warnings logged on the current thread so far.
    pub(crate) fn warnings(&self) -> usize {
        WARNINGS.with(Cell::get)
    }
}

/// Install the counting logger (idempotent).
pub(crate) fn capture_logs() -> CapturedLogs {
    INIT.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Trace);
        }
    });
    CapturedLogs
}
