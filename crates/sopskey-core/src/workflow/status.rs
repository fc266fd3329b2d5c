//! Read-only inspection of the key store.

use super::{WorkflowLevel, WorkflowReport};
use crate::config::KeyStoreLocation;
use crate::error::SopskeyResult;
use crate::keyfile::{parse_identity_file, read_identity_file};
use crate::keygen::KeyGenerator;
use sha2::{Digest, Sha256};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

/// Filesystem view of the key file plus the identities it holds.
#[derive(Debug, Clone)]
pub struct KeyStoreStatus {
    pub key_path: PathBuf,
    pub present: bool,
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub sha256: Option<String>,
    pub identities: Vec<IdentityStatus>,
}

#[derive(Debug, Clone)]
pub struct IdentityStatus {
    pub created: Option<String>,
    /// Recipient recorded in the `# public key:` comment.
    pub recorded_public_key: Option<String>,
    /// Recipient derived from the secret, when a generator was available.
    pub derived_public_key: Option<String>,
    pub error: Option<String>,
}

impl KeyStoreStatus {
    /// True when group or other permission bits are set on the key file.
    pub fn permissions_too_open(&self) -> bool {
        self.mode.map(|mode| mode & 0o077 != 0).unwrap_or(false)
    }

    pub fn report(&self) -> WorkflowReport {
        let mut report = WorkflowReport::new("Key store status");
        if !self.present {
            report.push(
                WorkflowLevel::Warn,
                format!("No key file at {}", self.key_path.display()),
            );
            return report;
        }

        let mode = self
            .mode
            .map(|mode| format!("{mode:04o}"))
            .unwrap_or_else(|| "----".to_string());
        let size = self
            .size
            .map(|size| size.to_string())
            .unwrap_or_else(|| "-".to_string());
        report.push(
            WorkflowLevel::Info,
            format!(
                "Key file: {} ({size} bytes, mode {mode})",
                self.key_path.display()
            ),
        );
        report.push(
            WorkflowLevel::Info,
            format!("SHA-256: {}", self.sha256.as_deref().unwrap_or("-")),
        );
        if self.permissions_too_open() {
            report.push(
                WorkflowLevel::Security,
                format!(
                    "Key file is readable by other users; run `chmod 600 {}`",
                    self.key_path.display()
                ),
            );
        }
        if self.identities.is_empty() {
            report.push(WorkflowLevel::Warn, "Key file holds no age identities");
        }

        for (index, identity) in self.identities.iter().enumerate() {
            let recipient = identity
                .derived_public_key
                .as_deref()
                .or(identity.recorded_public_key.as_deref())
                .unwrap_or("unknown");
            let created = identity.created.as_deref().unwrap_or("unknown");
            report.push(
                WorkflowLevel::Info,
                format!("Identity {}: {recipient} (created {created})", index + 1),
            );
            if let (Some(recorded), Some(derived)) = (
                identity.recorded_public_key.as_deref(),
                identity.derived_public_key.as_deref(),
            ) {
                if recorded != derived {
                    report.push(
                        WorkflowLevel::Warn,
                        format!(
                            "Identity {}: header lists {recorded} but the secret derives {derived}",
                            index + 1
                        ),
                    );
                }
            }
            if let Some(err) = identity.error.as_deref() {
                report.push(
                    WorkflowLevel::Warn,
                    format!("Identity {}: {err}", index + 1),
                );
            }
        }

        report
    }
}

/// Inspect the key file at `location`. When `generator` is supplied each secret is
/// re-derived so mismatched headers can be flagged.
pub fn inspect_keystore<G>(
    location: &KeyStoreLocation,
    generator: Option<&G>,
) -> SopskeyResult<KeyStoreStatus>
where
    G: KeyGenerator + ?Sized,
{
    let key_path = location.key_path.clone();
    let metadata = match fs::metadata(&key_path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(KeyStoreStatus {
                key_path,
                present: false,
                size: None,
                mode: None,
                sha256: None,
                identities: Vec::new(),
            });
        }
        Err(err) => return Err(err.into()),
    };

    let contents = read_identity_file(&key_path)?.unwrap_or_default();
    let sha256 = hex::encode(Sha256::digest(contents.as_bytes()));

    let identities = parse_identity_file(&contents)
        .into_iter()
        .map(|block| {
            let (derived_public_key, error) = match generator {
                Some(generator) => match generator.derive_public(&block.secret) {
                    Ok(public) => (Some(public.trim().to_string()), None),
                    Err(err) => (None, Some(err.to_string())),
                },
                None => (None, None),
            };
            IdentityStatus {
                created: block.created,
                recorded_public_key: block.public_key,
                derived_public_key,
                error,
            }
        })
        .collect();

    Ok(KeyStoreStatus {
        key_path,
        present: metadata.is_file(),
        size: Some(metadata.len()),
        mode: Some(metadata.permissions().mode() & 0o777),
        sha256: Some(sha256),
        identities,
    })
}
