//! Tracing setup and wire logging.
//!
//! Protocol lines get one macro with an explicit direction instead of a
//! span per category; everything else in the tree uses plain `tracing`
//! events under its own module target.

use tracing_subscriber::EnvFilter;

/// Log one protocol line as it crosses the wire: `rx:` is client to
/// server, `tx:` is server to client. Events carry a `direction` field
/// under the `postern::wire` target at TRACE, so a single filter
/// directive silences or captures the raw conversation.
#[macro_export]
macro_rules! wire {
    (rx: $($arg:tt)+) => {
        $crate::tracing::trace!(target: "postern::wire", direction = "rx", $($arg)+)
    };

    (tx: $($arg:tt)+) => {
        $crate::tracing::trace!(target: "postern::wire", direction = "tx", $($arg)+)
    };
}

/// Install the process-wide subscriber. `LOG_LEVEL` accepts any filter
/// directive (`info`, `postern_smtp=debug,warn`, `postern::wire=trace`);
/// without it, debug builds trace and release builds report at info.
pub fn init() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| {
        EnvFilter::new(if cfg!(debug_assertions) {
            "trace"
        } else {
            "info"
        })
    });

    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .init();
}
