//! These tests require a smart card reader with a card inserted and are gated behind the
//! `hardware` feature.
//! ```sh
//! CARD_SIGNER_PKCS11_LIB=/usr/lib/x86_64-linux-gnu/opensc-pkcs11.so \
//! CARD_SIGNER_PIN=12345 \
//! cargo test -p cosmian_card_signer --features hardware -- --ignored
//! ```
use std::path::PathBuf;

use crate::{SResult, SignerError, TracingReporter, load_provider, sign_and_verify};

fn env(name: &str) -> SResult<String> {
    std::env::var(name).map_err(|e| SignerError::Pkcs11(format!("{name}: {e}")))
}

#[test]
#[ignore = "Requires a PKCS#11 library and an inserted smart card"]
fn test_card_sign_and_verify() -> SResult<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("cosmian_card_signer=debug"))
        .try_init();
    let reporter = TracingReporter::new(true);
    let provider = load_provider(&PathBuf::from(env("CARD_SIGNER_PKCS11_LIB")?), &reporter)?;
    let report = sign_and_verify(
        &provider,
        &env("CARD_SIGNER_PIN")?,
        b"Message to sign and verify",
        &reporter,
    )?;
    assert!(report.outcome.is_valid(), "{}", report.outcome);
    assert_eq!(
        report.signature.len(),
        report.certificate.key_size_bits().div_ceil(8)
    );
    Ok(())
}
