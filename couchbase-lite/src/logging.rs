//! Routing of engine log messages.
//!
//! Every message goes to the `log` facade under a per domain target
//! (`cbl::db`, `cbl::query`, `cbl::sync`, `cbl::websock`, `cbl::listener`), so `env_logger`
//! can filter by domain. An optional process wide callback receives the same
//! messages at or above `callback_level()`.

use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU8, Ordering},
        RwLock,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogDomain {
    Database,
    Query,
    Replicator,
    Network,
    Listener,
}

impl LogDomain {
    #[inline]
    pub fn target(self) -> &'static str {
        match self {
            LogDomain::Database => "cbl::db",
            LogDomain::Query => "cbl::query",
            LogDomain::Replicator => "cbl::sync",
            LogDomain::Network => "cbl::websock",
            LogDomain::Listener => "cbl::listener",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Verbose = 1,
    Info = 2,
    Warning = 3,
    Error = 4,
    None = 5,
}

impl LogLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Debug,
            1 => LogLevel::Verbose,
            2 => LogLevel::Info,
            3 => LogLevel::Warning,
            4 => LogLevel::Error,
            _ => LogLevel::None,
        }
    }
    fn to_log_level(self) -> log::Level {
        use log::Level::*;
        match self {
            LogLevel::Debug => Trace,
            LogLevel::Verbose => Debug,
            LogLevel::Info => Info,
            LogLevel::Warning => Warn,
            LogLevel::Error | LogLevel::None => Error,
        }
    }
}

pub type LogCallback = fn(LogDomain, LogLevel, &str);

static CALLBACK: RwLock<Option<LogCallback>> = RwLock::new(None);
static CALLBACK_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Install or remove the process wide log callback
pub fn set_callback(callback: Option<LogCallback>) {
    match CALLBACK.write() {
        Ok(mut lock) => *lock = callback,
        Err(poisoned) => *poisoned.into_inner() = callback,
    }
}

pub fn callback() -> Option<LogCallback> {
    match CALLBACK.read() {
        Ok(lock) => *lock,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

pub fn set_callback_level(level: LogLevel) {
    CALLBACK_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn callback_level() -> LogLevel {
    LogLevel::from_u8(CALLBACK_LEVEL.load(Ordering::Relaxed))
}

pub(crate) fn emit(domain: LogDomain, level: LogLevel, args: fmt::Arguments) {
    if level == LogLevel::None {
        return;
    }
    log::log!(target: domain.target(), level.to_log_level(), "{}", args);
    if level < callback_level() {
        return;
    }
    if let Some(callback) = callback() {
        let msg = args.to_string();
        if catch_unwind(AssertUnwindSafe(|| callback(domain, level, &msg))).is_err() {
            log::error!(target: domain.target(), "log callback panicked");
        }
    }
}

/// `cbl_log!(LogDomain::Database, Info, "opened {}", name)`
macro_rules! cbl_log {
    ($domain:expr, $level:ident, $($arg:tt)+) => {
        $crate::logging::emit($domain, $crate::logging::LogLevel::$level, format_args!($($arg)+))
    };
}
pub(crate) use cbl_log;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static SEEN: Mutex<Vec<String>> = Mutex::new(Vec::new());

    fn remember(domain: LogDomain, level: LogLevel, msg: &str) {
        if let Ok(mut seen) = SEEN.lock() {
            seen.push(format!("{:?}/{:?}: {}", domain, level, msg));
        }
    }

    #[test]
    fn test_callback_receives_messages_above_level() {
        set_callback(Some(remember));
        set_callback_level(LogLevel::Warning);
        cbl_log!(LogDomain::Query, Info, "hidden {}", 1);
        cbl_log!(LogDomain::Query, Warning, "shown {}", 2);
        set_callback(None);
        set_callback_level(LogLevel::Info);
        let seen = SEEN.lock().unwrap();
        assert!(seen.iter().any(|m| m == "Query/Warning: shown 2"));
        assert!(!seen.iter().any(|m| m.contains("hidden")));
    }
}
