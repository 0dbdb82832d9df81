use std::fmt::{self, Display, Formatter};

use openssl::{
    hash::MessageDigest,
    pkey::{PKeyRef, Public},
    rsa::Padding,
    sign::Verifier,
};
use tracing::{debug, trace};

use crate::{SResult, SigningMechanism};

/// Result of checking a signature. A signature that does not verify is an outcome, not an
/// error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Valid,
    Invalid(String),
}

impl VerificationOutcome {
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

impl Display for VerificationOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Valid => write!(f, "signature verified"),
            Self::Invalid(reason) => write!(f, "signature verification failed: {reason}"),
        }
    }
}

/// Verify `signature` over `message` with the certificate public key, off the token.
///
/// # Errors
/// Only when the verifier itself cannot be set up for `public_key`. A wrong signature,
/// whatever its length, yields [`VerificationOutcome::Invalid`].
pub fn verify(
    public_key: &PKeyRef<Public>,
    signature: &[u8],
    message: &[u8],
    mechanism: SigningMechanism,
) -> SResult<VerificationOutcome> {
    let (digest, padding) = match mechanism {
        SigningMechanism::Sha256RsaPkcs1v15 => (MessageDigest::sha256(), Padding::PKCS1),
    };
    let mut verifier = Verifier::new(digest, public_key)?;
    verifier.set_rsa_padding(padding)?;
    let outcome = match verifier.verify_oneshot(signature, message) {
        Ok(true) => VerificationOutcome::Valid,
        Ok(false) => {
            VerificationOutcome::Invalid("the signature does not match the message".to_owned())
        }
        Err(e) => {
            trace!("openssl rejected the signature: {e}");
            VerificationOutcome::Invalid(format!("the signature is not well formed: {e}"))
        }
    };
    debug!("{outcome}");
    Ok(outcome)
}
