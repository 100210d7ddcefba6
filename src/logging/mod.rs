//! Tracing subscriber setup for the scheduler, bridge sessions and harness
//!
//! Logs go to stderr so the harness report on stdout stays readable. With
//! `APP_ENV=production` every event is a JSON object carrying its
//! `job_id`/`session_id` fields; anywhere else the output is colored text.

use crate::config::get_environment;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Used when `RUST_LOG` is unset. Redis connection chatter is only
/// interesting when something is wrong.
const DEFAULT_DIRECTIVES: &str = "info,redis=warn";

fn is_production(environment: &str) -> bool {
    matches!(environment, "production" | "prod")
}

/// Install the global subscriber. Later calls (e.g. from several tests in
/// one binary) leave the first subscriber in place.
pub fn init_logging() {
    let environment = get_environment();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let installed = if is_production(&environment) {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };

    if let Err(e) = installed {
        tracing::debug!(error = %e, environment = %environment, "Logging: subscriber already set");
    }
}
