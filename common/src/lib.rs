pub mod time;

use once_cell::sync::OnceCell;
use tracing_subscriber::{EnvFilter, fmt};

static LOGGER_INIT: OnceCell<()> = OnceCell::new();

/// Install the process-wide tracing subscriber.
///
/// `default_filter` applies when `RUST_LOG` is unset, so binaries can default
/// to `info` while test harnesses stay at `warn` without touching the
/// environment. Later calls are no-ops, which lets every entry point invoke
/// this unconditionally.
pub fn init_logger(service_name: &'static str, default_filter: &str) {
    LOGGER_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));

        // try_init so a harness that already installed a dispatcher (e.g.
        // a test-capture subscriber) is left in charge.
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_line_number(true)
            .with_span_events(fmt::format::FmtSpan::CLOSE)
            .try_init();

        tracing::info!(service = service_name, "logger initialized");
    });
}
