//! Tracing setup for host binaries embedding the bridge.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Level override used when `RUST_LOG` is not set.
pub const ENV_LOG: &str = "WIREBRIDGE_LOG";

/// Filter directives for a `WIREBRIDGE_LOG` value.
///
/// Worker stderr (`wirebridge::worker`) follows the base level; per-line
/// codec tracing stays quiet unless `RUST_LOG` asks for it.
pub fn default_directives(level: Option<&str>) -> String {
    let base_level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!(
        "wirebridge={level},wirebridge::worker={level},wirebridge::bridge::codec=warn",
        level = base_level
    )
}

/// Initialize tracing with WIREBRIDGE_LOG and LOG_FORMAT support.
///
/// Logs go to stderr. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_directives(std::env::var(ENV_LOG).ok().as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
