//! Log setup
use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

use crate::settings::{LogFormat, LogSettings};

static LOGGING_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber, `RUST_LOG` overrides the configured level.
/// Later calls are ignored.
pub fn init_logging(settings: &LogSettings) {
    if LOGGING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let _ = match settings.format {
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
        LogFormat::Text => builder.try_init(),
    };

    let _ = LOGGING_INIT.set(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        let settings = LogSettings {
            level: "not a [valid filter".to_owned(),
            format: LogFormat::Text,
        };
        init_logging(&settings);
        init_logging(&settings);
        tracing::info!("still logging");
    }
}
