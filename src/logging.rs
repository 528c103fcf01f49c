//! Kernel logging over the platform console.

use crate::platform::Console;

use shared::logging::ConsoleLog;

static LOGGER: ConsoleLog<Console> = ConsoleLog::new(Console);

/// Installs the console logger. Harmless to call more than once; the first
/// caller wins.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }
}
