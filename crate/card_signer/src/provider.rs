use std::{
    fmt::{self, Display, Formatter},
    path::{Path, PathBuf},
    ptr,
};

use libloading::Library;
use pkcs11_sys::{
    CK_C_CloseSession, CK_C_Finalize, CK_C_FindObjects, CK_C_FindObjectsFinal,
    CK_C_FindObjectsInit, CK_C_GetAttributeValue, CK_C_GetInfo, CK_C_GetSlotList,
    CK_C_GetTokenInfo, CK_C_INITIALIZE_ARGS, CK_C_Initialize, CK_C_Login, CK_C_Logout,
    CK_C_OpenSession, CK_C_Sign, CK_C_SignInit, CK_INFO, CK_VOID_PTR, CKF_OS_LOCKING_OK,
    CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_OK,
};
use tracing::{debug, warn};

use crate::{ReturnValue, SResult, SignerError, pkcs11_call};

/// A PKCS#11 provider module (for instance `opensc-pkcs11.so`) loaded in the process.
///
/// The struct keeps the dynamic library alive together with the Cryptoki entry points
/// used by the signing flow. Cryptoki is initialized on load and finalized on drop, so a
/// `Provider` should be created once and shared (behind an `Arc`) for the process lifetime.
///
/// ```no_run
/// use cosmian_card_signer::Provider;
///
/// let provider = Provider::load("/usr/lib/x86_64-linux-gnu/opensc-pkcs11.so")?;
/// # Ok::<(), cosmian_card_signer::SignerError>(())
/// ```
#[allow(non_snake_case)]
pub struct Provider {
    path: PathBuf,
    // `None` when the function table does not come from a dynamic library
    _library: Option<Library>,
    // `false` when Cryptoki was already initialized by another owner in the process
    owns_cryptoki: bool,
    pub(crate) C_Initialize: CK_C_Initialize,
    pub(crate) C_Finalize: CK_C_Finalize,
    pub(crate) C_GetInfo: CK_C_GetInfo,

    pub(crate) C_GetSlotList: CK_C_GetSlotList,
    pub(crate) C_GetTokenInfo: CK_C_GetTokenInfo,

    pub(crate) C_OpenSession: CK_C_OpenSession,
    pub(crate) C_CloseSession: CK_C_CloseSession,

    pub(crate) C_Login: CK_C_Login,
    pub(crate) C_Logout: CK_C_Logout,

    pub(crate) C_FindObjectsInit: CK_C_FindObjectsInit,
    pub(crate) C_FindObjects: CK_C_FindObjects,
    pub(crate) C_FindObjectsFinal: CK_C_FindObjectsFinal,
    pub(crate) C_GetAttributeValue: CK_C_GetAttributeValue,

    pub(crate) C_SignInit: CK_C_SignInit,
    pub(crate) C_Sign: CK_C_Sign,
}

impl Provider {
    /// Load the PKCS#11 module at `path` and initialize Cryptoki.
    ///
    /// # Errors
    /// * `ProviderNotFound` if the path does not exist, is not a loadable library,
    ///   or does not export one of the required Cryptoki functions
    /// * `Pkcs11` if `C_Initialize` fails
    pub fn load<P: AsRef<Path>>(path: P) -> SResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SignerError::ProviderNotFound(format!(
                "no PKCS#11 library at {}. Specify the path manually",
                path.display()
            )));
        }
        let not_loadable = |e: libloading::Error| {
            SignerError::ProviderNotFound(format!("{} cannot be loaded: {e}", path.display()))
        };
        #[allow(unsafe_code)]
        let mut provider = unsafe {
            let library = Library::new(path).map_err(not_loadable)?;
            Self {
                path: path.to_path_buf(),
                owns_cryptoki: false,
                C_Initialize: Some(*library.get(b"C_Initialize").map_err(not_loadable)?),
                C_Finalize: Some(*library.get(b"C_Finalize").map_err(not_loadable)?),
                C_GetInfo: Some(*library.get(b"C_GetInfo").map_err(not_loadable)?),
                C_GetSlotList: Some(*library.get(b"C_GetSlotList").map_err(not_loadable)?),
                C_GetTokenInfo: Some(*library.get(b"C_GetTokenInfo").map_err(not_loadable)?),
                C_OpenSession: Some(*library.get(b"C_OpenSession").map_err(not_loadable)?),
                C_CloseSession: Some(*library.get(b"C_CloseSession").map_err(not_loadable)?),
                C_Login: Some(*library.get(b"C_Login").map_err(not_loadable)?),
                C_Logout: Some(*library.get(b"C_Logout").map_err(not_loadable)?),
                C_FindObjectsInit: Some(
                    *library.get(b"C_FindObjectsInit").map_err(not_loadable)?,
                ),
                C_FindObjects: Some(*library.get(b"C_FindObjects").map_err(not_loadable)?),
                C_FindObjectsFinal: Some(
                    *library.get(b"C_FindObjectsFinal").map_err(not_loadable)?,
                ),
                C_GetAttributeValue: Some(
                    *library.get(b"C_GetAttributeValue").map_err(not_loadable)?,
                ),
                C_SignInit: Some(*library.get(b"C_SignInit").map_err(not_loadable)?),
                C_Sign: Some(*library.get(b"C_Sign").map_err(not_loadable)?),
                // we need to keep the library alive
                _library: Some(library),
            }
        };
        provider.owns_cryptoki = provider.initialize()?;
        debug!("PKCS#11 library loaded from {}", path.display());
        Ok(provider)
    }

    /// Build a provider from a function table that is already in the process
    #[cfg(test)]
    pub(crate) fn from_function_table(path: &str, table: FunctionTable) -> SResult<Self> {
        let mut provider = Self {
            path: PathBuf::from(path),
            _library: None,
            owns_cryptoki: false,
            C_Initialize: table.C_Initialize,
            C_Finalize: table.C_Finalize,
            C_GetInfo: table.C_GetInfo,
            C_GetSlotList: table.C_GetSlotList,
            C_GetTokenInfo: table.C_GetTokenInfo,
            C_OpenSession: table.C_OpenSession,
            C_CloseSession: table.C_CloseSession,
            C_Login: table.C_Login,
            C_Logout: table.C_Logout,
            C_FindObjectsInit: table.C_FindObjectsInit,
            C_FindObjects: table.C_FindObjects,
            C_FindObjectsFinal: table.C_FindObjectsFinal,
            C_GetAttributeValue: table.C_GetAttributeValue,
            C_SignInit: table.C_SignInit,
            C_Sign: table.C_Sign,
        };
        provider.owns_cryptoki = provider.initialize()?;
        Ok(provider)
    }

    /// The filesystem location the module was loaded from
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Initialize Cryptoki. Returns `false` when it was already initialized in the process.
    fn initialize(&self) -> SResult<bool> {
        let init_args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: CKF_OS_LOCKING_OK,
            pReserved: ptr::null_mut(),
        };
        #[allow(unsafe_code)]
        let rv = unsafe {
            self.C_Initialize.ok_or_else(|| {
                SignerError::Pkcs11("C_Initialize not available on library".to_owned())
            })?(ptr::from_ref(&init_args).cast_mut() as CK_VOID_PTR)
        };
        if rv == CKR_CRYPTOKI_ALREADY_INITIALIZED {
            warn!("Cryptoki already initialized by this process, reusing it");
            return Ok(false);
        }
        if rv != CKR_OK {
            return Err(SignerError::Pkcs11(format!(
                "Failed initializing the PKCS#11 library: {}",
                ReturnValue(rv)
            )));
        }
        Ok(true)
    }

    fn finalize(&self) -> SResult<()> {
        pkcs11_call!(
            self,
            SignerError::Pkcs11,
            "Failed to finalize the PKCS#11 library",
            C_Finalize,
            ptr::null_mut()
        );
        Ok(())
    }

    /// General information about the loaded Cryptoki library
    pub fn info(&self) -> SResult<Info> {
        let mut info = CK_INFO::default();
        pkcs11_call!(
            self,
            SignerError::Pkcs11,
            "Failed getting the library info",
            C_GetInfo,
            &raw mut info
        );
        Ok(info.into())
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        if !self.owns_cryptoki {
            return;
        }
        if let Err(e) = self.finalize() {
            warn!("{e}");
        }
    }
}

/// The Cryptoki entry points of a module linked into the process
#[cfg(test)]
#[allow(non_snake_case)]
pub(crate) struct FunctionTable {
    pub(crate) C_Initialize: CK_C_Initialize,
    pub(crate) C_Finalize: CK_C_Finalize,
    pub(crate) C_GetInfo: CK_C_GetInfo,
    pub(crate) C_GetSlotList: CK_C_GetSlotList,
    pub(crate) C_GetTokenInfo: CK_C_GetTokenInfo,
    pub(crate) C_OpenSession: CK_C_OpenSession,
    pub(crate) C_CloseSession: CK_C_CloseSession,
    pub(crate) C_Login: CK_C_Login,
    pub(crate) C_Logout: CK_C_Logout,
    pub(crate) C_FindObjectsInit: CK_C_FindObjectsInit,
    pub(crate) C_FindObjects: CK_C_FindObjects,
    pub(crate) C_FindObjectsFinal: CK_C_FindObjectsFinal,
    pub(crate) C_GetAttributeValue: CK_C_GetAttributeValue,
    pub(crate) C_SignInit: CK_C_SignInit,
    pub(crate) C_Sign: CK_C_Sign,
}

/// Trim the blank padding of a fixed-size Cryptoki text field
pub(crate) fn padded_to_string(field: &[u8]) -> String {
    String::from_utf8_lossy(field)
        .trim_end_matches(['\0', ' '])
        .to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub cryptoki_version: (u8, u8),
    pub manufacturer_id: String,
    pub library_description: String,
    pub library_version: (u8, u8),
}

impl From<CK_INFO> for Info {
    fn from(info: CK_INFO) -> Self {
        Self {
            cryptoki_version: (info.cryptokiVersion.major, info.cryptokiVersion.minor),
            manufacturer_id: padded_to_string(&info.manufacturerID),
            library_description: padded_to_string(&info.libraryDescription),
            library_version: (info.libraryVersion.major, info.libraryVersion.minor),
        }
    }
}

impl Display for Info {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cryptoki Version: {}.{}, Manufacturer ID: {}, Library Description: {}, Library \
             Version: {}.{}",
            self.cryptoki_version.0,
            self.cryptoki_version.1,
            self.manufacturer_id,
            self.library_description,
            self.library_version.0,
            self.library_version.1
        )
    }
}
