use crate::config::LogLevel;
use divvy_base::Result;
use slog::{Drain as _, Logger};

/// Build the root logger. The drain is deliberately synchronous: the master
/// forks, and an async drain's worker thread would not exist in the
/// children.
pub fn logger(level: LogLevel) -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level.as_slog_level()).fuse();
    Logger::root(drain, slog::o!())
}

pub fn run_with_logger<T>(level: LogLevel, body: impl FnOnce(Logger) -> Result<T>) -> Result<T> {
    body(logger(level))
}
