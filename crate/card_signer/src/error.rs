//! Copyright 2024 Cosmian Tech SAS

use pkcs11_sys::{
    CK_RV, CKR_ARGUMENTS_BAD, CKR_ATTRIBUTE_SENSITIVE, CKR_ATTRIBUTE_TYPE_INVALID,
    CKR_BUFFER_TOO_SMALL, CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_CRYPTOKI_NOT_INITIALIZED,
    CKR_DATA_LEN_RANGE, CKR_DEVICE_ERROR, CKR_DEVICE_REMOVED, CKR_FUNCTION_FAILED,
    CKR_GENERAL_ERROR, CKR_KEY_FUNCTION_NOT_PERMITTED, CKR_KEY_HANDLE_INVALID,
    CKR_KEY_TYPE_INCONSISTENT, CKR_MECHANISM_INVALID, CKR_OBJECT_HANDLE_INVALID, CKR_OK,
    CKR_OPERATION_ACTIVE, CKR_OPERATION_NOT_INITIALIZED, CKR_PIN_EXPIRED, CKR_PIN_INCORRECT,
    CKR_PIN_LEN_RANGE, CKR_PIN_LOCKED, CKR_SESSION_CLOSED, CKR_SESSION_HANDLE_INVALID,
    CKR_SLOT_ID_INVALID, CKR_TOKEN_NOT_PRESENT, CKR_TOKEN_NOT_RECOGNIZED,
    CKR_USER_ALREADY_LOGGED_IN, CKR_USER_NOT_LOGGED_IN,
};
use thiserror::Error;

pub type SResult<T> = Result<T, SignerError>;

/// Every way a signing run can fail.
///
/// A signature that does not verify is not an error: it is reported as
/// [`crate::VerificationOutcome::Invalid`].
#[derive(Error, Debug)]
pub enum SignerError {
    #[error("PKCS#11 provider not found: {0}")]
    ProviderNotFound(String),

    #[error("No smart card inserted: {0}")]
    NoTokenPresent(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Private key not found: {0}")]
    KeyNotFound(String),

    #[error("Certificate not found: {0}")]
    CertificateNotFound(String),

    #[error("Malformed certificate: {0}")]
    MalformedCertificate(String),

    #[error("Unsupported key: {0}")]
    UnsupportedKey(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Invalid session state: {0}")]
    InvalidSessionState(String),

    #[error("PKCS#11 Error: {0}")]
    Pkcs11(String),

    #[error(transparent)]
    Openssl(#[from] openssl::error::ErrorStack),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),
}

/// A Cryptoki return value, rendered with its symbolic name when known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnValue(pub CK_RV);

impl ReturnValue {
    #[must_use]
    pub const fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            CKR_OK => "CKR_OK",
            CKR_ARGUMENTS_BAD => "CKR_ARGUMENTS_BAD",
            CKR_ATTRIBUTE_SENSITIVE => "CKR_ATTRIBUTE_SENSITIVE",
            CKR_ATTRIBUTE_TYPE_INVALID => "CKR_ATTRIBUTE_TYPE_INVALID",
            CKR_BUFFER_TOO_SMALL => "CKR_BUFFER_TOO_SMALL",
            CKR_CRYPTOKI_ALREADY_INITIALIZED => "CKR_CRYPTOKI_ALREADY_INITIALIZED",
            CKR_CRYPTOKI_NOT_INITIALIZED => "CKR_CRYPTOKI_NOT_INITIALIZED",
            CKR_DATA_LEN_RANGE => "CKR_DATA_LEN_RANGE",
            CKR_DEVICE_ERROR => "CKR_DEVICE_ERROR",
            CKR_DEVICE_REMOVED => "CKR_DEVICE_REMOVED",
            CKR_FUNCTION_FAILED => "CKR_FUNCTION_FAILED",
            CKR_GENERAL_ERROR => "CKR_GENERAL_ERROR",
            CKR_KEY_FUNCTION_NOT_PERMITTED => "CKR_KEY_FUNCTION_NOT_PERMITTED",
            CKR_KEY_HANDLE_INVALID => "CKR_KEY_HANDLE_INVALID",
            CKR_KEY_TYPE_INCONSISTENT => "CKR_KEY_TYPE_INCONSISTENT",
            CKR_MECHANISM_INVALID => "CKR_MECHANISM_INVALID",
            CKR_OBJECT_HANDLE_INVALID => "CKR_OBJECT_HANDLE_INVALID",
            CKR_OPERATION_ACTIVE => "CKR_OPERATION_ACTIVE",
            CKR_OPERATION_NOT_INITIALIZED => "CKR_OPERATION_NOT_INITIALIZED",
            CKR_PIN_EXPIRED => "CKR_PIN_EXPIRED",
            CKR_PIN_INCORRECT => "CKR_PIN_INCORRECT",
            CKR_PIN_LEN_RANGE => "CKR_PIN_LEN_RANGE",
            CKR_PIN_LOCKED => "CKR_PIN_LOCKED",
            CKR_SESSION_CLOSED => "CKR_SESSION_CLOSED",
            CKR_SESSION_HANDLE_INVALID => "CKR_SESSION_HANDLE_INVALID",
            CKR_SLOT_ID_INVALID => "CKR_SLOT_ID_INVALID",
            CKR_TOKEN_NOT_PRESENT => "CKR_TOKEN_NOT_PRESENT",
            CKR_TOKEN_NOT_RECOGNIZED => "CKR_TOKEN_NOT_RECOGNIZED",
            CKR_USER_ALREADY_LOGGED_IN => "CKR_USER_ALREADY_LOGGED_IN",
            CKR_USER_NOT_LOGGED_IN => "CKR_USER_NOT_LOGGED_IN",
            _ => return None,
        })
    }
}

impl std::fmt::Display for ReturnValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({:#x})", self.0),
            None => write!(f, "{:#x}", self.0),
        }
    }
}

/// Call a Cryptoki function from the provider's function table and return early
/// with the given error variant when the token does not answer `CKR_OK`.
///
/// ```ignore
/// pkcs11_call!(self.provider, SignerError::Signing, "Failed initializing the signature",
///     C_SignInit, self.handle, &raw mut mechanism, key.handle());
/// ```
macro_rules! pkcs11_call {
    ($provider:expr, $error:path, $msg:expr, $function:ident $(, $arg:expr)* $(,)?) => {{
        #[allow(unsafe_code)]
        let rv = unsafe {
            $provider.$function.ok_or_else(|| {
                $crate::SignerError::Pkcs11(format!(
                    "{} not available on library",
                    stringify!($function)
                ))
            })?($($arg),*)
        };
        if rv != ::pkcs11_sys::CKR_OK {
            return Err($error(format!("{}: {}", $msg, $crate::ReturnValue(rv))));
        }
    }};
}
pub(crate) use pkcs11_call;
