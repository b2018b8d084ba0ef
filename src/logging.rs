// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! Thin wrappers over the slog global logger, plus a drain whose level can be
//! flipped at runtime by the `log_level` setting.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Once, RwLock,
};

use lazy_static::lazy_static;
use slog::{Drain, Level};

lazy_static! {
    /// Process-wide logger, mirroring the global-logger pattern the
    /// `slog_global` crate provides (which isn't available in this
    /// registry mirror).
    static ref GLOBAL_LOGGER: RwLock<slog::Logger> =
        RwLock::new(slog::Logger::root(slog::Discard, slog::o!()));
}

/// Install a logger as the process-wide global logger.
pub fn set_global(logger: slog::Logger) {
    *GLOBAL_LOGGER.write().unwrap() = logger;
}

/// Borrow the process-wide global logger.
pub fn borrow_global() -> std::sync::RwLockReadGuard<'static, slog::Logger> {
    GLOBAL_LOGGER.read().unwrap()
}

/// Logs a critical level message using the global logger.
#[macro_export]
macro_rules! crit( ($($args:tt)+) => {
    ::slog::crit!($crate::logging::borrow_global(), $($args)+)
};);

/// Logs a error level message using the global logger.
#[macro_export]
macro_rules! error( ($($args:tt)+) => {
    ::slog::error!($crate::logging::borrow_global(), $($args)+)
};);

/// Logs a warning level message using the global logger.
#[macro_export]
macro_rules! warn( ($($args:tt)+) => {
    ::slog::warn!($crate::logging::borrow_global(), $($args)+)
};);

/// Logs a info level message using the global logger.
#[macro_export]
macro_rules! info( ($($args:tt)+) => {
    ::slog::info!($crate::logging::borrow_global(), $($args)+)
};);

/// Logs a debug level message using the global logger.
#[macro_export]
macro_rules! debug( ($($args:tt)+) => {
    ::slog::debug!($crate::logging::borrow_global(), $($args)+)
};);

/// Logs a trace level message using the global logger.
#[macro_export]
macro_rules! trace( ($($args:tt)+) => {
    ::slog::trace!($crate::logging::borrow_global(), $($args)+)
};);

static EFFECTIVE_LEVEL: AtomicUsize = AtomicUsize::new(Level::Info as usize);
static INIT: Once = Once::new();

/// A drain that consults [`EFFECTIVE_LEVEL`] on every record, so the
/// `log_level` dynamic setting takes effect without rebuilding the logger.
struct RuntimeLevelFilter<D> {
    drain: D,
}

impl<D: Drain> Drain for RuntimeLevelFilter<D> {
    type Ok = Option<D::Ok>;
    type Err = Option<D::Err>;

    fn log(
        &self,
        record: &slog::Record<'_>,
        values: &slog::OwnedKVList,
    ) -> std::result::Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(current_level()) {
            return self.drain.log(record, values).map(Some).map_err(Some);
        }
        Ok(None)
    }
}

/// Install a terminal drain as the global logger. Idempotent, so tests may
/// call it freely.
pub fn init() {
    INIT.call_once(|| {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        let drain = RuntimeLevelFilter { drain }.ignore_res();
        let logger = slog::Logger::root(drain, slog::o!());
        set_global(logger);
    });
}

pub fn current_level() -> Level {
    Level::from_usize(EFFECTIVE_LEVEL.load(Ordering::Relaxed)).unwrap_or(Level::Info)
}

pub fn set_level(level: Level) {
    EFFECTIVE_LEVEL.store(level as usize, Ordering::Relaxed);
}

/// Map an eventing-style level name onto a slog level. Names arrive from the
/// settings document and are matched case-insensitively; unrecognised names
/// fall back to `Info`.
pub fn parse_level(name: &str) -> Level {
    match name.to_ascii_uppercase().as_str() {
        "SILENT" | "ERROR" => Level::Error,
        "WARNING" | "WARN" => Level::Warning,
        "INFO" => Level::Info,
        "VERBOSE" | "DEBUG" => Level::Debug,
        "TRACE" => Level::Trace,
        _ => Level::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("INFO"), Level::Info);
        assert_eq!(parse_level("debug"), Level::Debug);
        assert_eq!(parse_level("Trace"), Level::Trace);
        assert_eq!(parse_level("bogus"), Level::Info);
    }

    #[test]
    fn test_runtime_level_flip() {
        set_level(Level::Debug);
        assert_eq!(current_level(), Level::Debug);
        set_level(Level::Info);
        assert_eq!(current_level(), Level::Info);
    }
}
