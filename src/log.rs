//! Logging for runtime diagnostics.
//!
//! A small, self-contained logging facility: a global atomic level
//! filter, a swappable sink (stderr by default), and plain-text
//! records that carry the thread name and the id of the fiber that
//! emitted them. Fire-and-forget: logging never returns an error.
//!
//! # Example
//!
//! ```rust,ignore
//! use weft::log;
//!
//! log::set_level(log::LogLevel::Debug);
//! log::info("scheduler started");
//! log::debug(format!("fiber {} parked", 7));
//! ```

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace = 0,
    /// Debug level.
    Debug = 1,
    /// Info level.
    Info = 2,
    /// Warning level.
    Warn = 3,
    /// Error level.
    Error = 4,
    /// Off (no logging).
    Off = 5,
}

impl LogLevel {
    /// Get the level name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }

    /// Get the level from a u8.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(LogLevel::Trace),
            1 => Some(LogLevel::Debug),
            2 => Some(LogLevel::Info),
            3 => Some(LogLevel::Warn),
            4 => Some(LogLevel::Error),
            5 => Some(LogLevel::Off),
            _ => None,
        }
    }

    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "OFF" | "NONE" => Some(LogLevel::Off),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// A log record.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level.
    pub level: LogLevel,
    /// Log message.
    pub message: String,
    /// Timestamp (Unix milliseconds).
    pub timestamp: u64,
    /// Thread name (if available).
    pub thread_name: Option<String>,
    /// Id of the fiber that emitted the record (0 = a thread's root fiber).
    pub fiber: u64,
}

impl LogEntry {
    /// Create a new record stamped with the current time, thread, and fiber.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let thread_name = std::thread::current().name().map(|s| s.to_string());

        Self {
            level,
            message: message.into(),
            timestamp,
            thread_name,
            fiber: crate::fiber::Fiber::current_id(),
        }
    }

    /// Format as a plain-text line.
    pub fn format_plain(&self) -> String {
        let secs = self.timestamp / 1000;
        let millis = self.timestamp % 1000;
        let thread = self.thread_name.as_deref().unwrap_or("?");
        format!(
            "[{}.{:03}] {:<5} ({}:{}) {}",
            secs,
            millis,
            self.level.as_str(),
            thread,
            self.fiber,
            self.message
        )
    }
}

/// Minimum log level (atomic for fast checking).
static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Global sink. `None` means stderr.
static SINK: OnceLock<Mutex<Option<Box<dyn Write + Send>>>> = OnceLock::new();

fn sink() -> &'static Mutex<Option<Box<dyn Write + Send>>> {
    SINK.get_or_init(|| Mutex::new(None))
}

/// Set the minimum log level.
pub fn set_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Get the current minimum log level.
pub fn level() -> LogLevel {
    LogLevel::from_u8(MIN_LEVEL.load(Ordering::SeqCst)).unwrap_or(LogLevel::Info)
}

/// Redirect log output to a custom sink (pass `None` to restore stderr).
///
/// Intended for tests that want to capture runtime diagnostics.
pub fn set_sink(out: Option<Box<dyn Write + Send>>) {
    if let Ok(mut s) = sink().lock() {
        *s = out;
    }
}

/// Check if a record at `level` would be written.
pub fn would_log(level: LogLevel) -> bool {
    level != LogLevel::Off && level >= self::level()
}

/// Emit a record.
pub fn emit(entry: &LogEntry) {
    if !would_log(entry.level) {
        return;
    }
    let line = entry.format_plain();
    if let Ok(mut s) = sink().lock() {
        match s.as_mut() {
            Some(w) => {
                let _ = writeln!(w, "{}", line);
            }
            None => {
                let _ = writeln!(std::io::stderr(), "{}", line);
            }
        }
    }
}

/// Log a message at the given level.
pub fn log(level: LogLevel, message: impl Into<String>) {
    if !would_log(level) {
        return;
    }
    emit(&LogEntry::new(level, message));
}

/// Log a trace message.
pub fn trace(message: impl Into<String>) {
    log(LogLevel::Trace, message);
}

/// Log a debug message.
pub fn debug(message: impl Into<String>) {
    log(LogLevel::Debug, message);
}

/// Log an info message.
pub fn info(message: impl Into<String>) {
    log(LogLevel::Info, message);
}

/// Log a warning message.
pub fn warn(message: impl Into<String>) {
    log(LogLevel::Warn, message);
}

/// Log an error message.
pub fn error(message: impl Into<String>) {
    log(LogLevel::Error, message);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_roundtrip() {
        for v in 0..=5u8 {
            let level = LogLevel::from_u8(v).unwrap();
            assert_eq!(level as u8, v);
            assert_eq!(LogLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(LogLevel::from_u8(6), None);
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("bogus"), None);
    }

    #[test]
    fn test_would_log_respects_filter() {
        let old = level();
        set_level(LogLevel::Warn);
        assert!(!would_log(LogLevel::Info));
        assert!(would_log(LogLevel::Warn));
        assert!(would_log(LogLevel::Error));
        assert!(!would_log(LogLevel::Off));
        set_level(old);
    }

    #[test]
    fn test_format_plain_contains_parts() {
        let entry = LogEntry::new(LogLevel::Error, "boom");
        let line = entry.format_plain();
        assert!(line.contains("ERROR"));
        assert!(line.contains("boom"));
    }
}
