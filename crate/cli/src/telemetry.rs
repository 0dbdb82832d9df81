use tracing::{debug, span};
use tracing_subscriber::EnvFilter;

use crate::{
    config::ClapConfig,
    error::{CliError, CliResult},
};

const DEFAULT_FILTER: &str = "info";
const DEBUG_FILTER: &str = "info,cosmian_card_signer=debug,cosmian_card_signer_cli=debug";

/// The log filter: `--rust-log`, then `RUST_LOG`, then a default depending on `--debug`
fn env_filter(clap_config: &ClapConfig) -> CliResult<EnvFilter> {
    if let Some(directives) = &clap_config.logging.rust_log {
        return EnvFilter::try_new(directives)
            .map_err(|e| CliError::Configuration(format!("invalid log filter {directives}: {e}")));
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directives = if clap_config.debug {
        DEBUG_FILTER
    } else {
        DEFAULT_FILTER
    };
    EnvFilter::try_new(directives)
        .map_err(|e| CliError::Configuration(format!("invalid log filter {directives}: {e}")))
}

/// Initialize the logging system
///
/// # Errors
///
/// Returns an error if the log filter is invalid.
pub fn initialize_telemetry(clap_config: &ClapConfig) -> CliResult<()> {
    let filter = env_filter(clap_config)?;
    // a subscriber already installed by the caller is kept
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_level(true)
        .with_target(clap_config.debug)
        .with_ansi(true)
        .compact()
        .try_init();

    let span = span!(tracing::Level::INFO, "start");
    let _guard = span.enter();
    debug!("Telemetry initialized. Starting with config {clap_config:#?}");
    Ok(())
}
