mod objects;
mod sign;

mod session_impl;
pub use objects::{CertificateBytes, PrivateKeyRef};
pub use session_impl::{Session, SessionState};
pub use sign::{Signature, SigningMechanism};
