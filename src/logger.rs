//! Logging infrastructure for CrabSCSI
//!
//! This module provides logging via the `log` crate, writing to stderr
//! with a relative timestamp and a per-level tag. Hosts embedding the
//! engine in a larger target server will usually install their own
//! `log` backend instead; this one exists so the engine is observable
//! out of the box.

use log::{Level, LevelFilter, Metadata, Record};
use std::io::Write;
use std::sync::OnceLock;
use std::time::Instant;

/// Process start reference for relative timestamps (set during init)
static START: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since logger init
pub fn elapsed_ms() -> u128 {
    START.get().map(|s| s.elapsed().as_millis()).unwrap_or(0)
}

/// Stderr logger
struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            // Level strings with ANSI colors
            let level_str = match record.level() {
                Level::Error => "\x1b[31mERROR\x1b[0m",
                Level::Warn => "\x1b[33mWARN\x1b[0m ",
                Level::Info => "\x1b[32mINFO\x1b[0m ",
                Level::Debug => "\x1b[34mDEBUG\x1b[0m",
                Level::Trace => "\x1b[35mTRACE\x1b[0m",
            };

            let stderr = std::io::stderr();
            let mut out = stderr.lock();
            let _ = writeln!(
                out,
                "[{:>8}] [{}] {}",
                elapsed_ms(),
                level_str,
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: StderrLogger = StderrLogger;

/// Initialize the logging subsystem
pub fn init() {
    let _ = START.set(Instant::now());

    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Info))
        .expect("Failed to set logger");
}

/// Set the maximum log level
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
