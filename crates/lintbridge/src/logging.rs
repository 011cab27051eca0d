//! Tracing subscriber setup for binaries embedding the bridge.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directive derived from `LINTBRIDGE_LOG`.
fn filter_directive(level: Option<&str>) -> String {
    let level = match level {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("lintbridge={level}")
}

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` wins when set. Otherwise `LINTBRIDGE_LOG` picks the crate level.
/// `LOG_FORMAT=json` switches to JSON lines. Does nothing if a subscriber is
/// already installed.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var("LINTBRIDGE_LOG").ok();
        EnvFilter::new(filter_directive(level.as_deref()))
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
