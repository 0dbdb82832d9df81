use std::fmt::{self, Display, Formatter};

use openssl::pkey::{Id, PKey, Public};
use pem::{EncodeConfig, LineEnding, Pem};
use tracing::trace;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::{SResult, SignerError};

const PEM_TAG: &str = "CERTIFICATE";

/// An X.509 certificate read from the token, with the fields the signing flow reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCertificate {
    der: Vec<u8>,
    subject: String,
    issuer: String,
    serial: String,
    not_before: String,
    not_after: String,
    spki: Vec<u8>,
    key_size_bits: usize,
}

impl ParsedCertificate {
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Serial number, as colon separated hex bytes
    #[must_use]
    pub fn serial(&self) -> &str {
        &self.serial
    }

    #[must_use]
    pub fn not_before(&self) -> &str {
        &self.not_before
    }

    #[must_use]
    pub fn not_after(&self) -> &str {
        &self.not_after
    }

    /// The DER encoded `SubjectPublicKeyInfo`
    #[must_use]
    pub fn subject_public_key_info(&self) -> &[u8] {
        &self.spki
    }

    #[must_use]
    pub const fn key_size_bits(&self) -> usize {
        self.key_size_bits
    }

    /// The RSA public key of the certificate
    pub fn public_key(&self) -> SResult<PKey<Public>> {
        PKey::public_key_from_der(&self.spki).map_err(|e| {
            SignerError::MalformedCertificate(format!("unreadable public key: {e}"))
        })
    }
}

impl Display for ParsedCertificate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subject: {}, issuer: {}, serial: {}, RSA {} bits",
            self.subject, self.issuer, self.serial, self.key_size_bits
        )
    }
}

/// Decode a DER X.509 certificate holding an RSA public key.
///
/// # Errors
/// * `MalformedCertificate` if the bytes are not exactly one certificate or its public key
///   cannot be read
/// * `UnsupportedKey` if the public key is not RSA
pub fn decode(der: &[u8]) -> SResult<ParsedCertificate> {
    let (remaining, certificate) = X509Certificate::from_der(der)
        .map_err(|e| SignerError::MalformedCertificate(format!("invalid DER: {e}")))?;
    if !remaining.is_empty() {
        return Err(SignerError::MalformedCertificate(format!(
            "{} trailing bytes after the certificate",
            remaining.len()
        )));
    }
    let spki = certificate.public_key().raw.to_vec();
    let public_key = PKey::public_key_from_der(&spki)
        .map_err(|e| SignerError::MalformedCertificate(format!("unreadable public key: {e}")))?;
    if public_key.id() != Id::RSA {
        return Err(SignerError::UnsupportedKey(format!(
            "the certificate holds a {:?} key, only RSA keys are supported",
            public_key.id()
        )));
    }
    let parsed = ParsedCertificate {
        der: der.to_vec(),
        subject: certificate.subject().to_string(),
        issuer: certificate.issuer().to_string(),
        serial: certificate.raw_serial_as_string(),
        not_before: certificate.validity().not_before.to_string(),
        not_after: certificate.validity().not_after.to_string(),
        spki,
        key_size_bits: usize::try_from(public_key.bits())?,
    };
    trace!("Decoded certificate: {parsed}");
    Ok(parsed)
}

/// PEM encoding of the certificate, with LF line endings
#[must_use]
pub fn encode_to_pem(certificate: &ParsedCertificate) -> String {
    let pem = Pem::new(PEM_TAG, certificate.der.as_slice());
    pem::encode_config(&pem, EncodeConfig::new().set_line_ending(LineEnding::LF))
}

/// Decode a PEM `CERTIFICATE` block.
///
/// # Errors
/// * `MalformedCertificate` if the text is not a PEM certificate, plus every error of [`decode`]
pub fn decode_pem(text: &str) -> SResult<ParsedCertificate> {
    let pem = pem::parse(text)
        .map_err(|e| SignerError::MalformedCertificate(format!("invalid PEM: {e}")))?;
    if pem.tag() != PEM_TAG {
        return Err(SignerError::MalformedCertificate(format!(
            "expected a {PEM_TAG} PEM block, found {}",
            pem.tag()
        )));
    }
    decode(pem.contents())
}

#[cfg(test)]
mod tests {
    use openssl::{
        ec::{EcGroup, EcKey},
        nid::Nid,
        pkey::PKey,
    };

    use super::{decode, decode_pem, encode_to_pem};
    use crate::{
        SignerError,
        tests::{credentials, self_signed_certificate},
    };

    #[test]
    fn decodes_the_card_certificate() {
        let certificate = decode(&credentials().certificate).expect("certificate");
        assert_eq!(certificate.der(), credentials().certificate.as_slice());
        assert_eq!(certificate.subject(), "CN=Cosmian Test Card");
        assert_eq!(certificate.issuer(), "CN=Cosmian Test Card");
        assert_eq!(certificate.serial(), "2a");
        assert_eq!(certificate.key_size_bits(), 2048);
        let public_key = certificate.public_key().expect("public key");
        assert_eq!(public_key.bits(), 2048);
    }

    #[test]
    fn pem_is_lossless() {
        let certificate = decode(&credentials().certificate).expect("certificate");
        let pem = encode_to_pem(&certificate);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(!pem.contains('\r'));
        assert_eq!(decode_pem(&pem).expect("PEM certificate"), certificate);
    }

    #[test]
    fn truncated_certificate_is_malformed() {
        let der = &credentials().certificate;
        let err = decode(&der[..der.len() / 2]).expect_err("truncated");
        assert!(matches!(err, SignerError::MalformedCertificate(_)), "{err}");
        let err = decode(&[]).expect_err("empty");
        assert!(matches!(err, SignerError::MalformedCertificate(_)), "{err}");
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let mut der = credentials().certificate.clone();
        der.extend_from_slice(&[0, 0]);
        let err = decode(&der).expect_err("trailing bytes");
        assert!(matches!(err, SignerError::MalformedCertificate(_)), "{err}");
    }

    #[test]
    fn only_rsa_keys_are_supported() {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).expect("group");
        let key = PKey::from_ec_key(EcKey::generate(&group).expect("EC key")).expect("pkey");
        let der = self_signed_certificate(&key).to_der().expect("DER");
        let err = decode(&der).expect_err("EC key");
        assert!(matches!(err, SignerError::UnsupportedKey(_)), "{err}");
    }

    #[test]
    fn pem_of_something_else() {
        let pem = pem::encode(&pem::Pem::new("PRIVATE KEY", vec![1, 2, 3]));
        let err = decode_pem(&pem).expect_err("not a certificate");
        assert!(matches!(err, SignerError::MalformedCertificate(_)), "{err}");
        let err = decode_pem("hello").expect_err("not PEM");
        assert!(matches!(err, SignerError::MalformedCertificate(_)), "{err}");
    }
}
