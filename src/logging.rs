use crate::config::{Environment, LogFormat, Settings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn default_directives(env: &Environment) -> &'static str {
    match env {
        Environment::Dev => "taskmarket_backend=debug,tower_http=debug,sqlx=warn,info",
        Environment::Staging => "taskmarket_backend=debug,tower_http=info,sqlx=warn,info",
        Environment::Prod => "taskmarket_backend=info,tower_http=info,sqlx=error,warn",
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the per-environment
/// directives.
pub fn init_logging(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&settings.env)));

    let source_locations = settings.env.is_dev();
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(source_locations)
        .with_line_number(source_locations);

    let registry = tracing_subscriber::registry().with(filter);
    match settings.log_format {
        LogFormat::Json => registry.with(fmt_layer.json().flatten_event(true)).init(),
        LogFormat::Pretty => registry.with(fmt_layer.pretty()).init(),
        LogFormat::Compact => registry.with(fmt_layer.compact()).init(),
    }

    tracing::info!(env = ?settings.env, format = ?settings.log_format, "Logging initialized");
}
