use std::path::Path;

use pkcs11_sys::{CK_SESSION_HANDLE, CK_SLOT_ID};
use tracing::{debug, info, warn};

use crate::{
    CertificateBytes, Info, ParsedCertificate, PrivateKeyRef, Signature, Token, TokenInfo,
    VerificationOutcome,
};

/// What happened during a signing run, in order
#[derive(Debug, Clone, Copy)]
pub enum RunEvent<'a> {
    ProviderLoaded {
        path: &'a Path,
        info: Option<&'a Info>,
    },
    SlotsDiscovered {
        slot_ids: &'a [CK_SLOT_ID],
    },
    TokenSelected {
        token: &'a Token,
        info: Option<&'a TokenInfo>,
    },
    SessionOpened {
        handle: CK_SESSION_HANDLE,
    },
    LoggedIn,
    PrivateKeyFound {
        key: &'a PrivateKeyRef,
    },
    CertificateFound {
        certificate: &'a CertificateBytes,
    },
    CertificateDecoded {
        certificate: &'a ParsedCertificate,
    },
    MessageToSign {
        message: &'a [u8],
    },
    MessageSigned {
        signature: &'a Signature,
    },
    SessionClosed,
    Verified {
        outcome: &'a VerificationOutcome,
    },
}

/// Observer of a signing run. The library itself never prints.
pub trait Reporter {
    fn report(&self, event: &RunEvent<'_>);
}

/// Forwards run events to `tracing`.
///
/// Milestones are logged at `info`. The diagnostic trace (slots, handles, certificate
/// content) is only emitted, at `debug`, when `debug_trace` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter {
    pub debug_trace: bool,
}

impl TracingReporter {
    #[must_use]
    pub const fn new(debug_trace: bool) -> Self {
        Self { debug_trace }
    }
}

impl Reporter for TracingReporter {
    fn report(&self, event: &RunEvent<'_>) {
        match event {
            RunEvent::ProviderLoaded { path, info } => {
                info!("PKCS#11 library loaded: {}", path.display());
                if self.debug_trace {
                    if let Some(info) = info {
                        debug!("{info}");
                    }
                }
            }
            RunEvent::MessageToSign { message } => {
                info!("Data to sign: {}", String::from_utf8_lossy(message));
            }
            RunEvent::MessageSigned { signature } => {
                info!("Signature (hex): {}", signature.to_hex());
            }
            RunEvent::Verified { outcome } => {
                if outcome.is_valid() {
                    info!("{outcome}");
                } else {
                    warn!("{outcome}");
                }
            }
            _ if !self.debug_trace => {}
            RunEvent::SlotsDiscovered { slot_ids } => debug!("Available slots: {slot_ids:?}"),
            RunEvent::TokenSelected { token, info } => match info {
                Some(info) => debug!("Using slot {}: {info}", token.slot_id()),
                None => debug!("Using slot {}", token.slot_id()),
            },
            RunEvent::SessionOpened { handle } => debug!("Session {handle} opened"),
            RunEvent::LoggedIn => debug!("Login successful"),
            RunEvent::PrivateKeyFound { key } => {
                debug!("Private key found: {}", key.handle());
                match key.modulus_bits() {
                    Some(bits) => debug!("Private key length: {bits} bits"),
                    None => debug!("Private key length: not exposed by the token"),
                }
            }
            RunEvent::CertificateFound { certificate } => {
                debug!("Public certificate found: {}", certificate.handle());
                debug!("Public certificate (DER): {}", hex::encode(certificate.der()));
            }
            RunEvent::CertificateDecoded { certificate } => {
                debug!("Subject: {}", certificate.subject());
                debug!("Issuer: {}", certificate.issuer());
                debug!("Public key length: {} bits", certificate.key_size_bits());
            }
            RunEvent::SessionClosed => debug!("Logout done, session closed"),
        }
    }
}
