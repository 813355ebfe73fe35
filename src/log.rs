//! Logging utils. See ["log" crate documentation](https://docs.rs/log/) for details
//!
//! The runtime itself only emits through the [log](https://docs.rs/log/)
//! facade; embedders are free to install any logger. For quick setups and
//! for the test suite there is a minimal stderr logger:
//!
//! ```rust
//! use log::LevelFilter;
//! use corio::log::StderrLogger;
//!
//! log::set_logger(&StderrLogger).unwrap();
//! log::set_max_level(LevelFilter::Debug);
//! ```
use std::io::Write;

use log::{Log, Metadata, Record};

/// [Log](https://docs.rs/log/latest/log/trait.Log.html) trait implementation
/// writing one line per record to stderr.
pub struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = writeln!(
            std::io::stderr(),
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}
