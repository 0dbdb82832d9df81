use std::{cell::RefCell, sync::OnceLock};

use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::MessageDigest,
    pkey::{PKey, PKeyRef, Private},
    rsa::Rsa,
    x509::{X509, X509NameBuilder},
};

use crate::{Reporter, RunEvent};

#[cfg(feature = "hardware")]
mod hardware;

/// The RSA key and certificate held by the fake token
pub(crate) struct Credentials {
    /// DER private key
    pub(crate) private_key: Vec<u8>,
    /// DER X.509 certificate of `private_key`
    pub(crate) certificate: Vec<u8>,
    /// big-endian RSA modulus
    pub(crate) modulus: Vec<u8>,
}

/// Generated once per test binary
pub(crate) fn credentials() -> &'static Credentials {
    static CREDENTIALS: OnceLock<Credentials> = OnceLock::new();
    CREDENTIALS.get_or_init(|| {
        let rsa = Rsa::generate(2048).expect("RSA key");
        let modulus = rsa.n().to_vec();
        let key = PKey::from_rsa(rsa).expect("pkey");
        Credentials {
            private_key: key.private_key_to_der().expect("private key DER"),
            certificate: self_signed_certificate(&key)
                .to_der()
                .expect("certificate DER"),
            modulus,
        }
    })
}

pub(crate) fn self_signed_certificate(key: &PKeyRef<Private>) -> X509 {
    let mut name = X509NameBuilder::new().expect("name builder");
    name.append_entry_by_text("CN", "Cosmian Test Card")
        .expect("CN");
    let name = name.build();

    let mut builder = X509::builder().expect("x509 builder");
    builder.set_version(2).expect("version");
    let serial = BigNum::from_u32(42)
        .and_then(|bn| bn.to_asn1_integer())
        .expect("serial");
    builder.set_serial_number(&serial).expect("serial number");
    builder.set_subject_name(&name).expect("subject");
    builder.set_issuer_name(&name).expect("issuer");
    builder.set_pubkey(key).expect("public key");
    builder
        .set_not_before(&Asn1Time::days_from_now(0).expect("now"))
        .expect("not before");
    builder
        .set_not_after(&Asn1Time::days_from_now(365).expect("in a year"))
        .expect("not after");
    builder.sign(key, MessageDigest::sha256()).expect("sign");
    builder.build()
}

/// Keeps the name of every event it receives
#[derive(Default)]
pub(crate) struct RecordingReporter {
    pub(crate) events: RefCell<Vec<&'static str>>,
}

impl Reporter for RecordingReporter {
    fn report(&self, event: &RunEvent<'_>) {
        let name = match event {
            RunEvent::ProviderLoaded { .. } => "provider loaded",
            RunEvent::SlotsDiscovered { .. } => "slots discovered",
            RunEvent::TokenSelected { .. } => "token selected",
            RunEvent::SessionOpened { .. } => "session opened",
            RunEvent::LoggedIn => "logged in",
            RunEvent::PrivateKeyFound { .. } => "private key found",
            RunEvent::CertificateFound { .. } => "certificate found",
            RunEvent::CertificateDecoded { .. } => "certificate decoded",
            RunEvent::MessageToSign { .. } => "message to sign",
            RunEvent::MessageSigned { .. } => "message signed",
            RunEvent::SessionClosed => "session closed",
            RunEvent::Verified { .. } => "verified",
        };
        self.events.borrow_mut().push(name);
    }
}
