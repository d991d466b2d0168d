use std::fmt;
use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error,
    Warning,
    Info,
    Trace,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Error => "ERROR",
            Level::Warning => "WARN ",
            Level::Info => "INFO ",
            Level::Trace => "TRACE",
        };
        f.write_str(s)
    }
}

/// Minimal leveled logger writing to a single shared sink (stderr by default). Every
/// component holds an `Arc<Log>` rather than calling a process-wide macro, so tests can
/// substitute an in-memory sink and so nothing here depends on a global logger being
/// installed first.
pub struct Log {
    level: Level,
    sink: Mutex<Box<dyn Write + Send>>,
}

impl Log {
    pub fn stderr(level: Level) -> Arc<Self> {
        Arc::new(Self { level, sink: Mutex::new(Box::new(std::io::stderr())) })
    }

    pub fn to_writer(level: Level, sink: Box<dyn Write + Send>) -> Arc<Self> {
        Arc::new(Self { level, sink: Mutex::new(sink) })
    }

    pub fn log(&self, level: Level, component: &str, message: fmt::Arguments) {
        if level > self.level {
            return;
        }
        let mut sink = self.sink.lock();
        let _ = writeln!(sink, "[{level}] {component}: {message}");
    }
}

macro_rules! log_at {
    ($name:ident, $level:expr) => {
        #[macro_export]
        macro_rules! $name {
            ($log:expr, $component:expr, $($arg:tt)*) => {
                $log.log($level, $component, format_args!($($arg)*))
            };
        }
    };
}

log_at!(log_error, crate::log::Level::Error);
log_at!(log_warn, crate::log::Level::Warning);
log_at!(log_info, crate::log::Level::Info);
log_at!(log_trace, crate::log::Level::Trace);
