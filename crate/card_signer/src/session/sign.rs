use std::{
    fmt::{self, Display, Formatter},
    ptr,
};

use pkcs11_sys::{CK_MECHANISM, CK_MECHANISM_TYPE, CK_ULONG, CKM_SHA256_RSA_PKCS};
use tracing::debug;

use crate::{PrivateKeyRef, SResult, Session, SignerError, pkcs11_call};

/// The signature mechanisms the token is asked to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigningMechanism {
    /// RSA PKCS#1 v1.5 over a SHA-256 digest computed by the token
    #[default]
    Sha256RsaPkcs1v15,
}

impl SigningMechanism {
    #[must_use]
    pub const fn mechanism_type(self) -> CK_MECHANISM_TYPE {
        match self {
            Self::Sha256RsaPkcs1v15 => CKM_SHA256_RSA_PKCS,
        }
    }
}

impl Display for SigningMechanism {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256RsaPkcs1v15 => write!(f, "CKM_SHA256_RSA_PKCS"),
        }
    }
}

/// Raw signature bytes as returned by the token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature(Vec<u8>);

impl Signature {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl From<Vec<u8>> for Signature {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Session {
    /// Sign `message` on the token with `key`. The digest is computed by the token.
    ///
    /// # Errors
    /// * `Signing` if the session is not authenticated, if the token rejects the
    ///   operation, or if it returns a signature whose length does not match the key size
    pub fn sign(
        &self,
        key: &PrivateKeyRef,
        message: &[u8],
        mechanism: SigningMechanism,
    ) -> SResult<Signature> {
        self.ensure_authenticated()
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        let mut ck_mechanism = CK_MECHANISM {
            mechanism: mechanism.mechanism_type(),
            pParameter: ptr::null_mut(),
            ulParameterLen: 0,
        };
        pkcs11_call!(
            self.provider(),
            SignerError::Signing,
            "Failed to initialize the signature",
            C_SignInit,
            self.handle(),
            &raw mut ck_mechanism,
            key.handle()
        );

        let mut data = message.to_vec();
        let mut signature_len: CK_ULONG = 0;
        pkcs11_call!(
            self.provider(),
            SignerError::Signing,
            "Failed to compute the signature length",
            C_Sign,
            self.handle(),
            data.as_mut_ptr(),
            CK_ULONG::try_from(data.len())?,
            ptr::null_mut(),
            &raw mut signature_len
        );

        let mut signature = vec![0_u8; usize::try_from(signature_len)?];
        pkcs11_call!(
            self.provider(),
            SignerError::Signing,
            "Failed to sign the message",
            C_Sign,
            self.handle(),
            data.as_mut_ptr(),
            CK_ULONG::try_from(data.len())?,
            signature.as_mut_ptr(),
            &raw mut signature_len
        );
        signature.truncate(usize::try_from(signature_len)?);

        if let Some(bits) = key.modulus_bits() {
            if signature.len() != bits.div_ceil(8) {
                return Err(SignerError::Signing(format!(
                    "the token returned a {} bytes signature for a {bits} bits key",
                    signature.len()
                )));
            }
        }
        debug!(
            "Signed {} bytes with {mechanism}: {} bytes signature",
            message.len(),
            signature.len()
        );
        Ok(Signature(signature))
    }
}
