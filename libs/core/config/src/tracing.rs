use crate::Environment;
use tracing::{debug, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Default filter for production: service logs at info, broker client chatter at warn
const PRODUCTION_FILTER: &str = "info,lapin=warn,amq_protocol=warn";

/// Default filter for development
const DEVELOPMENT_FILTER: &str = "debug,lapin=info,amq_protocol=info";

/// Install color-eyre with a project-standard configuration.
///
/// Shows the error location and hides the environment section. Safe to call
/// more than once.
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Build the env filter, preferring `RUST_LOG` when it is set.
pub fn default_filter(environment: &Environment) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if environment.is_production() {
            EnvFilter::new(PRODUCTION_FILTER)
        } else {
            EnvFilter::new(DEVELOPMENT_FILTER)
        }
    })
}

/// Initialize tracing for a worker process.
///
/// - **Production** (`APP_ENV=production`): flattened JSON events without module targets
/// - **Development** (default): pretty, human-readable output
///
/// Both include the `tracing-error` `ErrorLayer` so eyre reports carry span traces.
/// `RUST_LOG` overrides the default filter. Calling this again after a subscriber is
/// installed is a no-op.
pub fn init_tracing(environment: &Environment) {
    let filter = default_filter(environment);

    let result = if environment.is_production() {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .flatten_event(true),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false)
                    .pretty(),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    };

    match result {
        Ok(_) => info!(environment = ?environment, "Tracing initialized"),
        Err(_) => debug!("Tracing already initialized, skipping re-initialization"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing(&Environment::Development);
        init_tracing(&Environment::Production);
        init_tracing(&Environment::Development);
    }

    #[test]
    fn test_default_filter_respects_rust_log() {
        temp_env::with_var("RUST_LOG", Some("warn"), || {
            let filter = default_filter(&Environment::Production);
            assert_eq!(filter.to_string(), "warn");
        });
    }

    #[test]
    fn test_default_filter_per_environment() {
        temp_env::with_var_unset("RUST_LOG", || {
            let production = default_filter(&Environment::Production).to_string();
            assert!(production.contains("lapin=warn"));

            let development = default_filter(&Environment::Development).to_string();
            assert!(development.contains("lapin=info"));
        });
    }
}
