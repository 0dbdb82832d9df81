use std::{
    fs,
    path::{Path, PathBuf},
};

use cosmian_card_signer::{ParsedCertificate, Signature, certificate};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{config::ClapConfig, error::CliResult};

/// Files written at the end of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    pub certificate_file: PathBuf,
    pub signature_file: PathBuf,
    pub message_file: PathBuf,
}

impl Artifacts {
    /// Use the configured file names, or random ones for the signature and the message
    #[must_use]
    pub fn from_config(config: &ClapConfig) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self {
            certificate_file: config.certificate_file.clone(),
            signature_file: config
                .signature_file
                .clone()
                .unwrap_or_else(|| PathBuf::from(format!("signature_{id}.bin"))),
            message_file: config
                .message_file
                .clone()
                .unwrap_or_else(|| PathBuf::from(format!("message_{id}.txt"))),
        }
    }

    pub fn save(
        &self,
        certificate: &ParsedCertificate,
        signature: &Signature,
        message: &[u8],
    ) -> CliResult<()> {
        write_certificate(&self.certificate_file, certificate)?;
        write_bytes(&self.signature_file, signature.as_bytes())?;
        debug!("Signature saved to {}", self.signature_file.display());
        write_bytes(&self.message_file, message)?;
        debug!("Message saved to {}", self.message_file.display());
        info!(
            "Certificate, signature and message saved to {}, {} and {}",
            self.certificate_file.display(),
            self.signature_file.display(),
            self.message_file.display()
        );
        Ok(())
    }
}

fn write_certificate(path: &Path, certificate: &ParsedCertificate) -> CliResult<()> {
    write_bytes(path, certificate::encode_to_pem(certificate).as_bytes())?;
    debug!("Certificate exported to {}", path.display());
    Ok(())
}

fn write_bytes(path: &Path, bytes: &[u8]) -> CliResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    Ok(())
}
