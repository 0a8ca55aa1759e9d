//! Root logger construction for the binaries.
//!
//! Library code never builds its own root logger; every constructor takes a
//! [`Logger`] and derives children with `o!()`.

use slog::{Drain, Level, Logger, o};
use slog_async::AsyncGuard;

/// Builds a root logger writing full-format records to stderr.
///
/// Records below `Info` are dropped unless `debug` is set. The returned
/// guard flushes pending records when dropped and must outlive every use of
/// the logger.
#[must_use]
pub fn create_logger(debug: bool) -> (Logger, AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let formatted = slog_term::FullFormat::new(decorator).build().fuse();
    let level = if debug { Level::Debug } else { Level::Info };
    let filtered = slog::LevelFilter::new(formatted, level).fuse();
    let (drain, guard) = slog_async::Async::new(filtered).build_with_guard();
    (Logger::root(drain.fuse(), o!("app" => "kola")), guard)
}
