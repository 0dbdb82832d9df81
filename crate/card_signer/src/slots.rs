use std::{
    fmt::{self, Display, Formatter},
    ptr,
    sync::Arc,
};

use pkcs11_sys::{CK_SLOT_ID, CK_TOKEN_INFO, CK_TRUE, CK_ULONG};
use tracing::{debug, warn};

use crate::{Provider, SResult, SignerError, pkcs11_call, provider::padded_to_string};

/// How a single object is picked when the token offers several candidates.
///
/// The signing flow assumes one token, one private key and one certificate.
/// When more are present the first one in discovery order wins; there is no
/// other disambiguation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    FirstDiscovered,
}

/// The policy used for slots, private keys and certificates
pub const SELECTION_POLICY: SelectionPolicy = SelectionPolicy::FirstDiscovered;

impl SelectionPolicy {
    pub fn select<T>(self, candidates: Vec<T>) -> Option<T> {
        match self {
            Self::FirstDiscovered => candidates.into_iter().next(),
        }
    }
}

/// A slot that currently holds a token
#[derive(Clone)]
pub struct Token {
    provider: Arc<Provider>,
    slot_id: CK_SLOT_ID,
}

impl Token {
    #[must_use]
    pub const fn slot_id(&self) -> CK_SLOT_ID {
        self.slot_id
    }

    pub(crate) fn provider(&self) -> &Arc<Provider> {
        &self.provider
    }

    /// Read the label, manufacturer, model and serial number of the token
    pub fn info(&self) -> SResult<TokenInfo> {
        let mut info = CK_TOKEN_INFO::default();
        pkcs11_call!(
            self.provider,
            SignerError::Pkcs11,
            format!("Failed getting the token info of slot {}", self.slot_id),
            C_GetTokenInfo,
            self.slot_id,
            &raw mut info
        );
        Ok(TokenInfo {
            label: padded_to_string(&info.label),
            manufacturer_id: padded_to_string(&info.manufacturerID),
            model: padded_to_string(&info.model),
            serial_number: padded_to_string(&info.serialNumber),
        })
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token").field("slot_id", &self.slot_id).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub label: String,
    pub manufacturer_id: String,
    pub model: String,
    pub serial_number: String,
}

impl Display for TokenInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} {}, serial {})",
            self.label, self.manufacturer_id, self.model, self.serial_number
        )
    }
}

/// Finds the slots of a provider that have a token inserted
pub struct TokenLocator {
    provider: Arc<Provider>,
}

impl TokenLocator {
    #[must_use]
    pub const fn new(provider: Arc<Provider>) -> Self {
        Self { provider }
    }

    /// List the slots that currently have a token present, in the order the provider
    /// reports them.
    ///
    /// # Errors
    /// * `Pkcs11` if the provider fails to enumerate its slots
    pub fn discover(&self) -> SResult<Vec<Token>> {
        let mut count: CK_ULONG = 0;
        pkcs11_call!(
            self.provider,
            SignerError::Pkcs11,
            "Failed counting the slots with a token",
            C_GetSlotList,
            CK_TRUE,
            ptr::null_mut(),
            &raw mut count
        );
        if count == 0 {
            return Ok(vec![]);
        }
        let mut slot_ids: Vec<CK_SLOT_ID> = vec![0; usize::try_from(count)?];
        pkcs11_call!(
            self.provider,
            SignerError::Pkcs11,
            "Failed listing the slots with a token",
            C_GetSlotList,
            CK_TRUE,
            slot_ids.as_mut_ptr(),
            &raw mut count
        );
        // a token may have been removed between the two calls
        slot_ids.truncate(usize::try_from(count)?);
        debug!("Slots with a token: {slot_ids:?}");
        Ok(slot_ids
            .into_iter()
            .map(|slot_id| Token {
                provider: self.provider.clone(),
                slot_id,
            })
            .collect())
    }

    /// Pick the token to work with.
    ///
    /// # Errors
    /// * `NoTokenPresent` if `tokens` is empty
    pub fn select(tokens: Vec<Token>) -> SResult<Token> {
        if tokens.len() > 1 {
            warn!(
                "{} tokens are present, using the first one ({SELECTION_POLICY:?})",
                tokens.len()
            );
        }
        SELECTION_POLICY.select(tokens).ok_or_else(|| {
            SignerError::NoTokenPresent("no slot reports an inserted token".to_owned())
        })
    }
}
