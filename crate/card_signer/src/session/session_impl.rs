//! Smart card session implementation
//!
//! A [`Session`] is the authenticated channel between the host and the token. It is the
//! only resource of the signing flow with a scoped lifetime:
//!
//! - it is opened from a [`Token`] and starts `Unauthenticated`
//! - a successful PIN login moves it to `Authenticated`
//! - `close()` (explicit, or from `Drop`) logs out if needed, closes the Cryptoki
//!   session and moves it to `Closed`, which is terminal
//!
//! Closing is idempotent and `C_CloseSession` is issued at most once per session, whatever
//! the exit path of the caller.

use std::{cell::Cell, ptr, sync::Arc};

use pkcs11_sys::{
    CK_SESSION_HANDLE, CK_ULONG, CK_UTF8CHAR_PTR, CKF_SERIAL_SESSION, CKR_DEVICE_REMOVED, CKR_OK,
    CKR_PIN_EXPIRED, CKR_PIN_INCORRECT, CKR_PIN_LOCKED, CKR_TOKEN_NOT_PRESENT,
    CKR_USER_ALREADY_LOGGED_IN, CKU_USER,
};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::{Provider, ReturnValue, SResult, SignerError, Token, pkcs11_call};

/// Authentication state of a [`Session`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Closed,
}

/// A Cryptoki session opened on a token.
///
/// The session is closed when dropped. Callers that want to observe a failing close
/// should call [`Session::close`] explicitly.
pub struct Session {
    provider: Arc<Provider>,
    handle: CK_SESSION_HANDLE,
    state: Cell<SessionState>,
}

impl Token {
    /// Open a read-only session on this token. The session is not authenticated yet.
    ///
    /// # Errors
    /// * `Pkcs11` if the token refuses to open a session
    pub fn open_session(&self) -> SResult<Session> {
        let mut handle: CK_SESSION_HANDLE = 0;
        pkcs11_call!(
            self.provider(),
            SignerError::Pkcs11,
            format!("Failed opening a session on slot {}", self.slot_id()),
            C_OpenSession,
            self.slot_id(),
            CKF_SERIAL_SESSION,
            ptr::null_mut(),
            None,
            &raw mut handle
        );
        debug!("Opened session {handle} on slot {}", self.slot_id());
        Ok(Session {
            provider: self.provider().clone(),
            handle,
            state: Cell::new(SessionState::Unauthenticated),
        })
    }
}

impl Session {
    /// Get the PKCS#11 session handle
    #[must_use]
    pub const fn handle(&self) -> CK_SESSION_HANDLE {
        self.handle
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub(crate) fn provider(&self) -> &Arc<Provider> {
        &self.provider
    }

    /// Fail unless the session can still talk to the token
    pub(crate) fn ensure_open(&self) -> SResult<()> {
        if self.state.get() == SessionState::Closed {
            return Err(SignerError::InvalidSessionState(format!(
                "session {} is closed",
                self.handle
            )));
        }
        Ok(())
    }

    /// Fail unless the user is logged in on this session
    pub(crate) fn ensure_authenticated(&self) -> SResult<()> {
        match self.state.get() {
            SessionState::Authenticated => Ok(()),
            SessionState::Unauthenticated => Err(SignerError::InvalidSessionState(format!(
                "session {} is not authenticated",
                self.handle
            ))),
            SessionState::Closed => self.ensure_open(),
        }
    }

    /// Log the user in with `pin`.
    ///
    /// On failure the session stays unauthenticated and must still be closed.
    ///
    /// # Errors
    /// * `Authentication` on a wrong, locked or expired PIN, or if the token is removed
    /// * `InvalidSessionState` if the session is already closed
    pub fn authenticate(&self, pin: &str) -> SResult<()> {
        self.ensure_open()?;
        if self.state.get() == SessionState::Authenticated {
            return Ok(());
        }
        let mut pin_bytes = Zeroizing::new(pin.as_bytes().to_vec());
        #[allow(unsafe_code)]
        let rv = unsafe {
            self.provider.C_Login.ok_or_else(|| {
                SignerError::Pkcs11("C_Login not available on library".to_owned())
            })?(
                self.handle,
                CKU_USER,
                pin_bytes.as_mut_ptr() as CK_UTF8CHAR_PTR,
                CK_ULONG::try_from(pin_bytes.len())?,
            )
        };
        match rv {
            CKR_OK => {}
            CKR_USER_ALREADY_LOGGED_IN => {
                warn!("user already logged in, ignoring login");
            }
            CKR_PIN_INCORRECT => {
                return Err(SignerError::Authentication(format!(
                    "the PIN was rejected: {}",
                    ReturnValue(rv)
                )));
            }
            CKR_PIN_LOCKED | CKR_PIN_EXPIRED => {
                return Err(SignerError::Authentication(format!(
                    "the token PIN is not usable: {}",
                    ReturnValue(rv)
                )));
            }
            CKR_DEVICE_REMOVED | CKR_TOKEN_NOT_PRESENT => {
                return Err(SignerError::Authentication(format!(
                    "the token was removed during login: {}",
                    ReturnValue(rv)
                )));
            }
            _ => {
                return Err(SignerError::Authentication(format!(
                    "Failed logging in: {}",
                    ReturnValue(rv)
                )));
            }
        }
        self.state.set(SessionState::Authenticated);
        debug!("Logged in on session {}", self.handle);
        Ok(())
    }

    /// Close the session and log out if necessary.
    ///
    /// Closing a closed session does nothing. The session is `Closed` after this call
    /// even if the token reports an error.
    pub fn close(&self) -> SResult<()> {
        let previous = self.state.replace(SessionState::Closed);
        if previous == SessionState::Closed {
            return Ok(());
        }
        let logout = if previous == SessionState::Authenticated {
            self.logout()
        } else {
            Ok(())
        };
        pkcs11_call!(
            self.provider,
            SignerError::Pkcs11,
            format!("Failed closing session {}", self.handle),
            C_CloseSession,
            self.handle
        );
        debug!("Closed session {}", self.handle);
        logout
    }

    fn logout(&self) -> SResult<()> {
        pkcs11_call!(
            self.provider,
            SignerError::Pkcs11,
            "Failed logging out",
            C_Logout,
            self.handle
        );
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("{e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        SessionState, SignerError,
        tests::fake_token::{FakeToken, open_token},
    };

    #[test]
    fn a_new_session_is_not_authenticated() {
        FakeToken::install(FakeToken::default());
        let (_provider, token) = open_token();
        let session = token.open_session().expect("session");
        assert_eq!(session.state(), SessionState::Unauthenticated);
        let err = session.find_private_key().expect_err("not logged in");
        assert!(matches!(err, SignerError::InvalidSessionState(_)), "{err}");
    }

    #[test]
    fn login_then_close() {
        FakeToken::install(FakeToken::default());
        let (_provider, token) = open_token();
        let session = token.open_session().expect("session");
        session.authenticate(FakeToken::PIN).expect("login");
        assert_eq!(session.state(), SessionState::Authenticated);
        session.close().expect("close");
        assert_eq!(session.state(), SessionState::Closed);
        let calls = FakeToken::calls();
        let tail: Vec<_> = calls.iter().rev().take(2).rev().copied().collect();
        assert_eq!(tail, vec!["C_Logout", "C_CloseSession"]);
    }

    #[test]
    fn wrong_pin_leaves_a_closable_session() {
        FakeToken::install(FakeToken::default());
        let (_provider, token) = open_token();
        let session = token.open_session().expect("session");
        let err = session.authenticate("0000").expect_err("wrong PIN");
        assert!(matches!(err, SignerError::Authentication(_)), "{err}");
        assert!(err.to_string().contains("CKR_PIN_INCORRECT"), "{err}");
        assert_eq!(session.state(), SessionState::Unauthenticated);

        session.close().expect("close");
        assert_eq!(session.state(), SessionState::Closed);
        // no logout without a login
        assert!(!FakeToken::calls().contains(&"C_Logout"));
    }

    #[test]
    fn locked_token_fails_authentication() {
        FakeToken::install(FakeToken {
            pin_locked: true,
            ..FakeToken::default()
        });
        let (_provider, token) = open_token();
        let session = token.open_session().expect("session");
        let err = session
            .authenticate(FakeToken::PIN)
            .expect_err("locked PIN");
        assert!(err.to_string().contains("CKR_PIN_LOCKED"), "{err}");
    }

    #[test]
    fn close_is_idempotent_and_happens_once() {
        FakeToken::install(FakeToken::default());
        let (_provider, token) = open_token();
        let session = token.open_session().expect("session");
        session.authenticate(FakeToken::PIN).expect("login");
        session.close().expect("first close");
        session.close().expect("second close");
        drop(session);
        assert_eq!(FakeToken::count("C_CloseSession"), 1);
        assert_eq!(FakeToken::count("C_Logout"), 1);
    }

    #[test]
    fn dropping_a_session_closes_it() {
        FakeToken::install(FakeToken::default());
        let (_provider, token) = open_token();
        {
            let session = token.open_session().expect("session");
            session.authenticate(FakeToken::PIN).expect("login");
        }
        assert_eq!(FakeToken::count("C_CloseSession"), 1);
        assert_eq!(FakeToken::open_sessions(), 0);
    }

    #[test]
    fn closed_session_refuses_everything() {
        FakeToken::install(FakeToken::default());
        let (_provider, token) = open_token();
        let session = token.open_session().expect("session");
        session.close().expect("close");
        assert!(matches!(
            session.authenticate(FakeToken::PIN),
            Err(SignerError::InvalidSessionState(_))
        ));
        assert!(matches!(
            session.find_certificate(),
            Err(SignerError::InvalidSessionState(_))
        ));
        assert!(matches!(
            session.find_private_key(),
            Err(SignerError::InvalidSessionState(_))
        ));
        assert_eq!(FakeToken::count("C_Login"), 0);
        assert_eq!(FakeToken::count("C_FindObjectsInit"), 0);
    }
}
