use std::io::Write;
use std::str::FromStr;

use log::{Level, LevelFilter, Metadata, Record};

/// Environment variable holding the diagnostic level (`error` .. `trace`).
pub const LOG_ENV: &str = "CS_LOG";

/// Install the stderr logger, tagging every record with `name` and the pid.
///
/// Calling it twice keeps the first logger.
pub fn init(name: &'static str) {
    let level = std::env::var(LOG_ENV)
        .ok()
        .and_then(|v| LevelFilter::from_str(v.trim()).ok())
        .unwrap_or(LevelFilter::Info);

    let logger: &'static Logger = Box::leak(Box::new(Logger { name }));
    if log::set_logger(logger).is_ok() {
        log::set_max_level(level);
        debug!("Logger Initialized at {}", level);
    }
}

struct Logger {
    name: &'static str,
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let (symbol, level_name) = match record.level() {
            Level::Error => ("\x1b[31m[X]\x1b[0m", "ERROR"),
            Level::Warn => ("\x1b[33m[!]\x1b[0m", "WARN"),
            Level::Info => ("\x1b[34m[+]\x1b[0m", "INFO"),
            Level::Debug => ("\x1b[36m[#]\x1b[0m", "DEBUG"),
            Level::Trace => ("\x1b[32m[%]\x1b[0m", "TRACE"),
        };

        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        let _ = writeln!(
            out,
            "{} \x1b[1m{}\x1b[0m {}[{}] - {}:{} - {}",
            symbol,
            level_name,
            self.name,
            std::process::id(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}
