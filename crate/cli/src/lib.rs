use cosmian_card_signer::{SigningReport, TracingReporter, load_provider, sign_and_verify};
use tracing::info;
use zeroize::Zeroizing;

use crate::{config::ClapConfig, error::CliResult, output::Artifacts};

pub mod config;
pub mod error;
pub mod output;
mod telemetry;

pub use telemetry::initialize_telemetry;

/// Sign the configured message with the smart card, verify the signature,
/// then save the certificate, the signature and the message.
///
/// The artifacts are saved whether or not the signature verifies.
///
/// # Errors
/// Every failure of the signing run, and failures writing the artifacts
pub fn run(mut config: ClapConfig) -> CliResult<(SigningReport, Artifacts)> {
    let pin = Zeroizing::new(std::mem::take(&mut config.pin));
    let reporter = TracingReporter::new(config.debug);

    let provider = load_provider(&config.pkcs11_lib, &reporter)?;
    let report = sign_and_verify(&provider, &pin, config.message.as_bytes(), &reporter)?;
    drop(provider);

    let artifacts = Artifacts::from_config(&config);
    artifacts.save(
        &report.certificate,
        &report.signature,
        config.message.as_bytes(),
    )?;
    if let Some(token_info) = &report.token_info {
        info!("Signed with {token_info}");
    }
    Ok((report, artifacts))
}

/// The process exit code of a run: `0` when the signature verifies, `2` when it was
/// produced but does not verify, `1` on any failure
#[must_use]
pub fn exit_code(result: &CliResult<bool>) -> i32 {
    match result {
        Ok(true) => 0,
        Ok(false) => 2,
        Err(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use cosmian_card_signer::SignerError;

    use super::exit_code;
    use crate::error::CliError;

    #[test]
    fn verified_signature_exits_with_0() {
        assert_eq!(exit_code(&Ok(true)), 0);
    }

    #[test]
    fn failed_verification_is_not_a_fatal_error() {
        assert_eq!(exit_code(&Ok(false)), 2);
    }

    #[test]
    fn errors_exit_with_1() {
        let err = CliError::from(SignerError::Authentication("wrong PIN".to_owned()));
        assert_eq!(exit_code(&Err(err)), 1);
        let err = CliError::Configuration("the PIN is empty".to_owned());
        assert_eq!(exit_code(&Err(err)), 1);
    }
}
