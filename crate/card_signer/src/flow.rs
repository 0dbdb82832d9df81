use std::{path::Path, sync::Arc};

use tracing::warn;

use crate::{
    ParsedCertificate, Provider, RunEvent, SResult, Session, Signature, SignerError,
    SigningMechanism, Token, TokenInfo, TokenLocator, VerificationOutcome, certificate,
    report::Reporter, verify,
};

/// The mechanism used by [`sign_and_verify`]
pub const SIGNING_MECHANISM: SigningMechanism = SigningMechanism::Sha256RsaPkcs1v15;

/// Everything a signing run produced
#[derive(Debug, Clone)]
pub struct SigningReport {
    pub token: Token,
    pub token_info: Option<TokenInfo>,
    pub certificate: ParsedCertificate,
    pub signature: Signature,
    pub outcome: VerificationOutcome,
}

/// Load the PKCS#11 module at `path` and report it
pub fn load_provider(path: &Path, reporter: &dyn Reporter) -> SResult<Arc<Provider>> {
    let provider = Provider::load(path)?;
    let info = provider
        .info()
        .inspect_err(|e| warn!("cannot read the PKCS#11 library info: {e}"))
        .ok();
    reporter.report(&RunEvent::ProviderLoaded {
        path: provider.path(),
        info: info.as_ref(),
    });
    Ok(Arc::new(provider))
}

/// Sign `message` with the first private key of the first token, then verify the
/// signature against the certificate stored on the same token.
///
/// The session is closed before verification and on every error path. A signature that
/// does not verify is reported in [`SigningReport::outcome`], it is not an error.
///
/// # Errors
/// Every failure up to and including signing, and closing the session
pub fn sign_and_verify(
    provider: &Arc<Provider>,
    pin: &str,
    message: &[u8],
    reporter: &dyn Reporter,
) -> SResult<SigningReport> {
    let tokens = TokenLocator::new(provider.clone()).discover()?;
    let slot_ids: Vec<_> = tokens.iter().map(Token::slot_id).collect();
    reporter.report(&RunEvent::SlotsDiscovered {
        slot_ids: &slot_ids,
    });
    let token = TokenLocator::select(tokens)?;
    let token_info = token
        .info()
        .inspect_err(|e| warn!("cannot read the token info: {e}"))
        .ok();
    reporter.report(&RunEvent::TokenSelected {
        token: &token,
        info: token_info.as_ref(),
    });

    let session = token.open_session()?;
    reporter.report(&RunEvent::SessionOpened {
        handle: session.handle(),
    });
    let signed = sign_in_session(&session, pin, message, reporter);
    let closed = session.close();
    let (certificate, signature) = signed?;
    closed?;
    reporter.report(&RunEvent::SessionClosed);

    let public_key = certificate.public_key()?;
    let outcome = verify(
        &public_key,
        signature.as_bytes(),
        message,
        SIGNING_MECHANISM,
    )?;
    reporter.report(&RunEvent::Verified { outcome: &outcome });

    Ok(SigningReport {
        token,
        token_info,
        certificate,
        signature,
        outcome,
    })
}

fn sign_in_session(
    session: &Session,
    pin: &str,
    message: &[u8],
    reporter: &dyn Reporter,
) -> SResult<(ParsedCertificate, Signature)> {
    session.authenticate(pin)?;
    reporter.report(&RunEvent::LoggedIn);

    let key = session.find_private_key()?;
    reporter.report(&RunEvent::PrivateKeyFound { key: &key });

    let certificate_bytes = session.find_certificate()?;
    reporter.report(&RunEvent::CertificateFound {
        certificate: &certificate_bytes,
    });
    let certificate = certificate::decode(certificate_bytes.der())?;
    reporter.report(&RunEvent::CertificateDecoded {
        certificate: &certificate,
    });

    reporter.report(&RunEvent::MessageToSign { message });
    let signature = session.sign(&key, message, SIGNING_MECHANISM)?;
    let expected_len = certificate.key_size_bits().div_ceil(8);
    if signature.len() != expected_len {
        return Err(SignerError::Signing(format!(
            "the token returned a {} bytes signature, the certificate key needs {expected_len} \
             bytes",
            signature.len()
        )));
    }
    reporter.report(&RunEvent::MessageSigned {
        signature: &signature,
    });
    Ok((certificate, signature))
}
