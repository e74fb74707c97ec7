//! Console logging initialization using the tracing ecosystem.
//!
//! Container-friendly: logs go to stdout, level comes from `RUST_LOG` (or
//! `SIS_BRIDGE_LOG_LEVEL` as a fallback), ANSI colors only when attached to
//! a terminal. Safe to call more than once; only the first call installs
//! the subscriber.

use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize console logging for applications embedding the resilience core.
pub fn init_tracing() {
    TRACING_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| {
                let level =
                    std::env::var("SIS_BRIDGE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
                EnvFilter::try_new(level)
            })
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_ansi(std::io::stdout().is_terminal());

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    });
}
