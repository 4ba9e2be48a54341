//! Stderr logger backing the `log` facade
//!
//! The loader logs its lifecycle (handler installation, segment publication,
//! teardown) through the standard `log` macros. The fault handler itself
//! never logs: the logger takes a stream lock, which is off limits in
//! signal context.
//!
//! The level is read once from the `LAZYRUN_LOG` environment variable
//! (`error`, `warn`, `info`, `debug`, `trace`; default `warn`).

use std::io::Write;

use log::{LevelFilter, Log, Metadata, Record};

/// Environment variable controlling the log level.
const LOG_ENV_VAR: &str = "LAZYRUN_LOG";

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(
            stderr,
            "[{:5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

fn level_from_str(value: &str) -> Option<LevelFilter> {
    match value.to_ascii_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

/// Install the stderr logger and set the level from the environment.
///
/// Safe to call more than once; only the first call installs.
pub fn init() {
    let level = std::env::var(LOG_ENV_VAR)
        .ok()
        .and_then(|v| level_from_str(&v))
        .unwrap_or(LevelFilter::Warn);

    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
