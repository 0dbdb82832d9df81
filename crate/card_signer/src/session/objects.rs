use std::ptr;

use pkcs11_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_TYPE, CK_OBJECT_CLASS, CK_OBJECT_HANDLE, CK_ULONG, CKA_CLASS,
    CKA_MODULUS, CKA_MODULUS_BITS, CKA_VALUE, CKO_CERTIFICATE, CKO_PRIVATE_KEY,
    CKR_ATTRIBUTE_SENSITIVE, CKR_ATTRIBUTE_TYPE_INVALID, CKR_OK,
};
use tracing::{debug, trace, warn};

use crate::{ReturnValue, SELECTION_POLICY, SResult, Session, SignerError, pkcs11_call};

const FIND_BATCH_SIZE: usize = 16;

/// The private key object resolved on the token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivateKeyRef {
    handle: CK_OBJECT_HANDLE,
    modulus_bits: Option<usize>,
}

impl PrivateKeyRef {
    #[must_use]
    pub const fn handle(&self) -> CK_OBJECT_HANDLE {
        self.handle
    }

    /// The RSA modulus size, when the token exposes it
    #[must_use]
    pub const fn modulus_bits(&self) -> Option<usize> {
        self.modulus_bits
    }
}

/// The certificate object resolved on the token, with its DER value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBytes {
    handle: CK_OBJECT_HANDLE,
    der: Vec<u8>,
}

impl CertificateBytes {
    #[must_use]
    pub const fn handle(&self) -> CK_OBJECT_HANDLE {
        self.handle
    }

    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    #[must_use]
    pub fn into_der(self) -> Vec<u8> {
        self.der
    }
}

impl Session {
    /// Find the private key to sign with.
    ///
    /// # Errors
    /// * `InvalidSessionState` unless the session is authenticated
    /// * `KeyNotFound` if the token holds no private key
    pub fn find_private_key(&self) -> SResult<PrivateKeyRef> {
        self.ensure_authenticated()?;
        let handles = self.find_object_handles(CKO_PRIVATE_KEY)?;
        if handles.len() > 1 {
            debug!(
                "{} private keys on the token, keeping the first one: {handles:?}",
                handles.len()
            );
        }
        let handle = SELECTION_POLICY.select(handles).ok_or_else(|| {
            SignerError::KeyNotFound("the token holds no private key object".to_owned())
        })?;
        let mut key = PrivateKeyRef {
            handle,
            modulus_bits: None,
        };
        key.modulus_bits = self
            .key_size_in_bits(&key)
            .inspect_err(|e| warn!("cannot read the size of private key {handle}: {e}"))
            .ok()
            .flatten();
        Ok(key)
    }

    /// Find the certificate stored next to the private key and read its DER value.
    ///
    /// # Errors
    /// * `InvalidSessionState` if the session is closed
    /// * `CertificateNotFound` if there is no certificate or its value is empty
    pub fn find_certificate(&self) -> SResult<CertificateBytes> {
        self.ensure_open()?;
        let handles = self.find_object_handles(CKO_CERTIFICATE)?;
        let handle = SELECTION_POLICY.select(handles).ok_or_else(|| {
            SignerError::CertificateNotFound("the token holds no certificate object".to_owned())
        })?;
        let der = self
            .attribute_value(handle, CKA_VALUE)?
            .filter(|der| !der.is_empty())
            .ok_or_else(|| {
                SignerError::CertificateNotFound(format!(
                    "the certificate object {handle} has no value"
                ))
            })?;
        Ok(CertificateBytes { handle, der })
    }

    /// Size of the RSA modulus of `key`, read from `CKA_MODULUS_BITS` or, failing that,
    /// from `CKA_MODULUS`. `None` when the token exposes neither.
    pub fn key_size_in_bits(&self, key: &PrivateKeyRef) -> SResult<Option<usize>> {
        self.ensure_open()?;
        if let Some(bits) = self.attribute_value(key.handle, CKA_MODULUS_BITS)? {
            if let Ok(bits) = <[u8; size_of::<CK_ULONG>()]>::try_from(bits.as_slice()) {
                return Ok(Some(usize::try_from(CK_ULONG::from_ne_bytes(bits))?));
            }
        }
        Ok(self
            .attribute_value(key.handle, CKA_MODULUS)?
            .and_then(|modulus| bit_length(&modulus)))
    }

    fn find_object_handles(&self, class: CK_OBJECT_CLASS) -> SResult<Vec<CK_OBJECT_HANDLE>> {
        self.ensure_open()?;
        let mut class = class;
        let mut template = [CK_ATTRIBUTE {
            type_: CKA_CLASS,
            pValue: (&raw mut class).cast::<std::ffi::c_void>(),
            ulValueLen: CK_ULONG::try_from(size_of::<CK_OBJECT_CLASS>())?,
        }];
        pkcs11_call!(
            self.provider(),
            SignerError::Pkcs11,
            "Failed to initialize object search",
            C_FindObjectsInit,
            self.handle(),
            template.as_mut_ptr(),
            CK_ULONG::try_from(template.len())?
        );
        let found = self.collect_found_objects();
        // the search must be finalized even when collecting failed
        let finalized = self.find_objects_final();
        let handles = found?;
        finalized?;
        trace!("Objects of class {class}: {handles:?}");
        Ok(handles)
    }

    fn collect_found_objects(&self) -> SResult<Vec<CK_OBJECT_HANDLE>> {
        let mut object_handles = Vec::new();
        let mut handles_buf = [CK_OBJECT_HANDLE::default(); FIND_BATCH_SIZE];
        loop {
            let mut object_count: CK_ULONG = 0;
            pkcs11_call!(
                self.provider(),
                SignerError::Pkcs11,
                "Failed to find objects",
                C_FindObjects,
                self.handle(),
                handles_buf.as_mut_ptr(),
                CK_ULONG::try_from(FIND_BATCH_SIZE)?,
                &raw mut object_count
            );
            if object_count == 0 {
                break;
            }
            object_handles.extend_from_slice(
                handles_buf
                    .get(..usize::try_from(object_count)?)
                    .ok_or_else(|| {
                        SignerError::Pkcs11("more objects returned than requested".to_owned())
                    })?,
            );
        }
        Ok(object_handles)
    }

    fn find_objects_final(&self) -> SResult<()> {
        pkcs11_call!(
            self.provider(),
            SignerError::Pkcs11,
            "Failed to finalize object search",
            C_FindObjectsFinal,
            self.handle()
        );
        Ok(())
    }

    /// Read a single attribute of an object. `None` when the object does not have it
    /// or does not reveal it.
    fn attribute_value(
        &self,
        object: CK_OBJECT_HANDLE,
        attribute: CK_ATTRIBUTE_TYPE,
    ) -> SResult<Option<Vec<u8>>> {
        let mut template = [CK_ATTRIBUTE {
            type_: attribute,
            pValue: ptr::null_mut(),
            ulValueLen: 0,
        }];
        #[allow(unsafe_code)]
        let rv = unsafe {
            self.provider().C_GetAttributeValue.ok_or_else(|| {
                SignerError::Pkcs11("C_GetAttributeValue not available on library".to_owned())
            })?(
                self.handle(),
                object,
                template.as_mut_ptr(),
                CK_ULONG::try_from(template.len())?,
            )
        };
        match rv {
            CKR_OK => {}
            CKR_ATTRIBUTE_TYPE_INVALID | CKR_ATTRIBUTE_SENSITIVE => return Ok(None),
            _ => {
                return Err(SignerError::Pkcs11(format!(
                    "Failed to read attribute {attribute:#x} of object {object}: {}",
                    ReturnValue(rv)
                )));
            }
        }
        if template[0].ulValueLen == CK_ULONG::MAX {
            return Ok(None);
        }
        let mut value = vec![0_u8; usize::try_from(template[0].ulValueLen)?];
        template[0].pValue = value.as_mut_ptr().cast::<std::ffi::c_void>();
        pkcs11_call!(
            self.provider(),
            SignerError::Pkcs11,
            format!("Failed to read attribute {attribute:#x} of object {object}"),
            C_GetAttributeValue,
            self.handle(),
            object,
            template.as_mut_ptr(),
            CK_ULONG::try_from(template.len())?
        );
        value.truncate(usize::try_from(template[0].ulValueLen)?);
        Ok(Some(value))
    }
}

/// Number of significant bits of a big-endian unsigned integer
fn bit_length(be_bytes: &[u8]) -> Option<usize> {
    let first = be_bytes.iter().position(|b| *b != 0)?;
    let leading = usize::try_from(be_bytes[first].leading_zeros()).ok()?;
    Some((be_bytes.len() - first) * 8 - leading)
}

#[cfg(test)]
mod tests {
    use super::bit_length;
    use crate::{
        SignerError,
        tests::fake_token::{FakeToken, open_token},
    };

    #[test]
    fn bit_length_of_a_modulus() {
        assert_eq!(bit_length(&[0x00, 0x80, 0x00]), Some(16));
        assert_eq!(bit_length(&[0x01]), Some(1));
        assert_eq!(bit_length(&[0x00, 0x00]), None);
        assert_eq!(bit_length(&[]), None);
    }

    #[test]
    fn finds_the_key_and_the_certificate() {
        FakeToken::install(FakeToken::default());
        let (_provider, token) = open_token();
        let session = token.open_session().expect("session");
        session.authenticate(FakeToken::PIN).expect("login");

        let key = session.find_private_key().expect("private key");
        assert_eq!(key.handle(), FakeToken::PRIVATE_KEY_HANDLE);
        assert_eq!(key.modulus_bits(), Some(2048));

        let certificate = session.find_certificate().expect("certificate");
        assert_eq!(certificate.handle(), FakeToken::CERTIFICATE_HANDLE);
        assert_eq!(certificate.der(), FakeToken::default().certificate.as_slice());

        // every search is finalized
        assert_eq!(
            FakeToken::count("C_FindObjectsInit"),
            FakeToken::count("C_FindObjectsFinal")
        );
    }

    #[test]
    fn key_size_falls_back_to_the_modulus() {
        FakeToken::install(FakeToken {
            expose_modulus_bits: false,
            ..FakeToken::default()
        });
        let (_provider, token) = open_token();
        let session = token.open_session().expect("session");
        session.authenticate(FakeToken::PIN).expect("login");
        let key = session.find_private_key().expect("private key");
        assert_eq!(key.modulus_bits(), Some(2048));
    }

    #[test]
    fn unreadable_key_size_is_not_fatal() {
        FakeToken::install(FakeToken {
            fail_key_attributes: true,
            ..FakeToken::default()
        });
        let (_provider, token) = open_token();
        let session = token.open_session().expect("session");
        session.authenticate(FakeToken::PIN).expect("login");
        let key = session.find_private_key().expect("private key");
        assert_eq!(key.handle(), FakeToken::PRIVATE_KEY_HANDLE);
        assert_eq!(key.modulus_bits(), None);
        let err = session.key_size_in_bits(&key).expect_err("size read fails");
        assert!(err.to_string().contains("CKR_GENERAL_ERROR"), "{err}");
    }

    #[test]
    fn hidden_key_size() {
        FakeToken::install(FakeToken {
            expose_modulus_bits: false,
            expose_modulus: false,
            ..FakeToken::default()
        });
        let (_provider, token) = open_token();
        let session = token.open_session().expect("session");
        session.authenticate(FakeToken::PIN).expect("login");
        let key = session.find_private_key().expect("private key");
        assert_eq!(key.modulus_bits(), None);
    }

    #[test]
    fn the_first_of_several_keys_is_used() {
        FakeToken::install(FakeToken {
            extra_private_keys: 20,
            ..FakeToken::default()
        });
        let (_provider, token) = open_token();
        let session = token.open_session().expect("session");
        session.authenticate(FakeToken::PIN).expect("login");
        let key = session.find_private_key().expect("private key");
        assert_eq!(key.handle(), FakeToken::PRIVATE_KEY_HANDLE);
        // more keys than a single search batch
        assert!(FakeToken::count("C_FindObjects") >= 3);
    }

    #[test]
    fn missing_key() {
        FakeToken::install(FakeToken {
            has_private_key: false,
            ..FakeToken::default()
        });
        let (_provider, token) = open_token();
        let session = token.open_session().expect("session");
        session.authenticate(FakeToken::PIN).expect("login");
        let err = session.find_private_key().expect_err("no key");
        assert!(matches!(err, SignerError::KeyNotFound(_)), "{err}");
    }

    #[test]
    fn missing_certificate() {
        FakeToken::install(FakeToken {
            has_certificate: false,
            ..FakeToken::default()
        });
        let (_provider, token) = open_token();
        let session = token.open_session().expect("session");
        let err = session.find_certificate().expect_err("no certificate");
        assert!(matches!(err, SignerError::CertificateNotFound(_)), "{err}");
    }

    #[test]
    fn empty_certificate() {
        FakeToken::install(FakeToken {
            certificate: vec![],
            ..FakeToken::default()
        });
        let (_provider, token) = open_token();
        let session = token.open_session().expect("session");
        let err = session.find_certificate().expect_err("empty certificate");
        assert!(matches!(err, SignerError::CertificateNotFound(_)), "{err}");
    }
}
