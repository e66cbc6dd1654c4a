//! Tracing initialisation for SF-Bench binaries.
//!
//! Call [`init_tracing`] once at program start. Log lines go to stderr so
//! commands that print JSON to stdout (capacity reports, rendered
//! summaries) stay machine-readable.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global tracing subscriber.
///
/// * `json`: when `true`, emit newline-delimited JSON log lines for log
///   aggregation pipelines.
/// * `level`: default verbosity when `RUST_LOG` is not set.
///
/// `RUST_LOG` takes precedence for fine-grained filtering. Safe to call
/// more than once; the global subscriber can only be set once per
/// process, and subsequent calls are ignored.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}
