//! Diagnostic logging setup for the binary.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LEVEL: &str = "info";

/// Filter directive used when `RUST_LOG` is unset: the command-line level,
/// then the configured one, then `info`.
pub fn fallback_directive(cli_level: Option<&str>, config_level: Option<&str>) -> String {
    cli_level
        .or(config_level)
        .map(str::trim)
        .filter(|level| !level.is_empty())
        .unwrap_or(DEFAULT_LEVEL)
        .to_string()
}

/// Installs the global subscriber. Logs go to stderr, or are appended to
/// `file` when one is given.
pub fn init_logging(
    cli_level: Option<&str>,
    config_level: Option<&str>,
    file: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let fallback = fallback_directive(cli_level, config_level);
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&fallback))?;

    match file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .try_init()?;
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()?;
        }
    }
    Ok(())
}
