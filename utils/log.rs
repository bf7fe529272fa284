//! Console logger for rumpfiber
//!
//! This module provides the `log` backend: records at or above the
//! configured level are written to the console as `[LEVEL] target: message`.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Log, Metadata, Record};

use crate::utils::console;

/// Logger writing to the console
struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;
static INSTALLED: AtomicBool = AtomicBool::new(false);

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            console::print_fmt(format_args!(
                "[{:<5}] {}: {}\n",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {
        console::flush();
    }
}

/// Install the console logger with the given maximum level
///
/// Later calls only change the level, so a host that installed its own
/// logger keeps it.
pub fn init(level: LevelFilter) {
    if !INSTALLED.swap(true, Ordering::SeqCst) && log::set_logger(&LOGGER).is_err() {
        log::debug!("a logger is already installed, keeping it");
    }
    set_level(level);
}

/// Set the log level
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

/// Get the current log level
pub fn level() -> LevelFilter {
    log::max_level()
}
