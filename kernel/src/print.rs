//! Print macros and `log` crate wiring for kernel output.
//!
//! On bare metal this crate has no attached console driver (out of scope:
//! the surrounding kernel owns the VGA/serial devices); `print!`/`println!`
//! are no-ops there. Under `#[cfg(test)]` they forward to the host's
//! standard output so test failures are legible.

#[cfg(test)]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::print::_print_test(format_args!($($arg)*)));
}

#[cfg(test)]
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[cfg(not(test))]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {};
}

#[cfg(not(test))]
#[macro_export]
macro_rules! println {
    ($($arg:tt)*) => {};
}

#[cfg(test)]
pub fn _print_test(args: core::fmt::Arguments) {
    std::print!("{}", args);
}

/// Forward a [`crate::log_service`] entry through the `log` crate so a
/// `log::Log` subscriber sees the same message the structured ring buffer
/// records, then append it to the ring buffer.
pub fn log_and_record(level: crate::log_service::LogLevel, subsystem: &str, message: &str) {
    use crate::log_service::LogLevel;
    let log_level = match level {
        LogLevel::Error => log::Level::Error,
        LogLevel::Warn => log::Level::Warn,
        LogLevel::Info => log::Level::Info,
        LogLevel::Debug => log::Level::Debug,
        LogLevel::Trace => log::Level::Trace,
    };
    log::log!(target: "vm", log_level, "[{}] {}", subsystem, message);
    crate::log_service::klog(level, subsystem, message);
}
