//! Tracing subscriber setup.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogSeverity;

/// Installs a stderr subscriber filtered at `severity`.
///
/// `RUST_LOG` takes precedence when set. Returns `false` if a global
/// subscriber was already installed, which is not an error: embedding
/// applications usually bring their own.
pub fn init(severity: LogSeverity) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(severity.as_filter()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_target(true).with_writer(std::io::stderr))
        .try_init()
        .is_ok()
}
