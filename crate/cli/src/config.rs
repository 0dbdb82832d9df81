use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
};

use clap::{Args, Parser};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CliError, CliResult};

/// Environment variable pointing to a TOML configuration file
pub const CARD_SIGNER_CONF_ENV: &str = "CARD_SIGNER_CONF";
pub(crate) const CARD_SIGNER_CONF_DEFAULT_SYSTEM_PATH: &str = "/etc/cosmian/card_signer.toml";

/// The OpenSC PKCS#11 module installed by the platform package manager
#[cfg(target_os = "macos")]
pub const DEFAULT_PKCS11_LIB: &str = "/opt/homebrew/Cellar/opensc/0.25.1/lib/opensc-pkcs11.so";
#[cfg(target_os = "windows")]
pub const DEFAULT_PKCS11_LIB: &str = "C:\\Windows\\System32\\opensc-pkcs11.dll";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub const DEFAULT_PKCS11_LIB: &str = "/usr/lib/x86_64-linux-gnu/opensc-pkcs11.so";

pub const DEFAULT_CERTIFICATE_FILE: &str = "public_cert.pem";

fn default_pkcs11_lib() -> PathBuf {
    PathBuf::from(DEFAULT_PKCS11_LIB)
}

fn default_certificate_file() -> PathBuf {
    PathBuf::from(DEFAULT_CERTIFICATE_FILE)
}

#[derive(Debug, Default, Args, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// An alternative to setting the `RUST_LOG` environment variable.
    /// Setting this variable will override the `RUST_LOG` environment variable
    #[clap(long, env("CARD_SIGNER_RUST_LOG"), verbatim_doc_comment)]
    pub rust_log: Option<String>,
}

/// Sign a message with the private key of a PKCS#11 smart card,
/// then verify the signature with the certificate stored on the card.
///
/// When `CARD_SIGNER_CONF` points to a TOML file, or `/etc/cosmian/card_signer.toml`
/// exists, the configuration is read from that file and the command line is ignored.
#[derive(Parser, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[clap(version, about, verbatim_doc_comment)]
pub struct ClapConfig {
    /// PIN of the smart card
    #[clap(long, env = "CARD_SIGNER_PIN", hide_env_values = true)]
    pub pin: String,

    /// Message to sign
    #[clap(long, env = "CARD_SIGNER_MESSAGE")]
    pub message: String,

    /// Path of the PKCS#11 library
    #[clap(long = "pkcs11-lib", env = "CARD_SIGNER_PKCS11_LIB", default_value = DEFAULT_PKCS11_LIB)]
    #[serde(default = "default_pkcs11_lib")]
    pub pkcs11_lib: PathBuf,

    /// File to save the signature to.
    /// Defaults to `signature_<random>.bin` in the current directory
    #[clap(long, env = "CARD_SIGNER_SIGNATURE_FILE", verbatim_doc_comment)]
    pub signature_file: Option<PathBuf>,

    /// File to save the signed message to.
    /// Defaults to `message_<random>.txt` in the current directory
    #[clap(long, env = "CARD_SIGNER_MESSAGE_FILE", verbatim_doc_comment)]
    pub message_file: Option<PathBuf>,

    /// File to save the card certificate to, in PEM
    #[clap(long, env = "CARD_SIGNER_CERTIFICATE_FILE", default_value = DEFAULT_CERTIFICATE_FILE)]
    #[serde(default = "default_certificate_file")]
    pub certificate_file: PathBuf,

    /// Show the debug trace: slots, object handles, certificate content
    #[clap(long, env = "CARD_SIGNER_DEBUG", default_value = "false")]
    #[serde(default)]
    pub debug: bool,

    #[clap(flatten)]
    #[serde(default)]
    pub logging: LoggingConfig,
}

// the PIN is never printed
impl fmt::Debug for ClapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("")
            .field("message", &self.message)
            .field("PKCS#11 library", &self.pkcs11_lib)
            .field("signature file", &self.signature_file)
            .field("message file", &self.message_file)
            .field("certificate file", &self.certificate_file)
            .field("debug", &self.debug)
            .field("logging", &self.logging)
            .finish()
    }
}

impl ClapConfig {
    /// The configuration file to use, if any
    #[must_use]
    pub fn location() -> Option<PathBuf> {
        if let Ok(path) = env::var(CARD_SIGNER_CONF_ENV) {
            return Some(PathBuf::from(path));
        }
        let system_path = PathBuf::from(CARD_SIGNER_CONF_DEFAULT_SYSTEM_PATH);
        system_path.exists().then_some(system_path)
    }

    /// Read the configuration from the configuration file when there is one,
    /// from the command line and the environment otherwise.
    ///
    /// # Errors
    /// Return an error if the configuration file cannot be read or is not valid TOML.
    pub fn load_from_file() -> CliResult<Self> {
        let config = match Self::location() {
            Some(path) => Self::from_toml(&path)?,
            None => Self::parse(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Read the configuration from a TOML file
    pub fn from_toml(path: &Path) -> CliResult<Self> {
        debug!("Loading configuration from: {}", path.display());
        let content = fs::read_to_string(path).map_err(|e| {
            CliError::Configuration(format!(
                "cannot read the configuration file {}: {e}",
                path.display()
            ))
        })?;
        Ok(toml::from_str(&content)?)
    }

    fn validate(&self) -> CliResult<()> {
        if self.pin.is_empty() {
            return Err(CliError::Configuration("the PIN is empty".to_owned()));
        }
        Ok(())
    }
}
