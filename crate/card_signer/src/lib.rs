//! Copyright 2024 Cosmian Tech SAS
//!
//! Sign a message with the private key of a PKCS#11 smart card and check the signature
//! against the certificate stored on the card.

mod error;
pub use error::{ReturnValue, SResult, SignerError};
pub(crate) use error::pkcs11_call;

mod provider;
pub use provider::{Info, Provider};

mod slots;
pub use slots::{SELECTION_POLICY, SelectionPolicy, Token, TokenInfo, TokenLocator};

mod session;
pub use session::{
    CertificateBytes, PrivateKeyRef, Session, SessionState, Signature, SigningMechanism,
};

pub mod certificate;
pub use certificate::ParsedCertificate;

mod verify;
pub use verify::{VerificationOutcome, verify};

mod report;
pub use report::{Reporter, RunEvent, TracingReporter};

mod flow;
pub use flow::{SIGNING_MECHANISM, SigningReport, load_provider, sign_and_verify};

#[cfg(test)]
mod tests;
