//! Root logger construction.
use slog::{Drain, Level, LevelFilter, Logger};

/// A logger writing compact records to standard error, dropping records below `level`.
///
/// Records are written from a background thread; dropping every clone of the returned logger
/// flushes them.
pub fn create_logger(level: Level) -> Logger {
    let decorator = slog_term::PlainDecorator::new(std::io::stderr());
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = LevelFilter::new(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, slog::o!("service" => "ethsign"))
}

/// A logger that drops every record.
pub fn discard_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}
