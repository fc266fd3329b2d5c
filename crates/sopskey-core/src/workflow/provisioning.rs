//! Ensure an age identity exists at the key store location.

use super::{WorkflowLevel, WorkflowReport};
use crate::config::KeyStoreLocation;
use crate::error::{SopskeyError, SopskeyResult};
use crate::keyfile::{
    append_identity_block, compose_identity_block, contains_secret, ensure_private_dir,
    extract_secret_key_line, looks_like_public_key, read_identity_file, stage_file,
    validate_secret_key, StagedFile, KEY_FILE_MODE,
};
use crate::keygen::KeyGenerator;
use chrono::Utc;
use log::{debug, info};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Where the private key comes from.
#[derive(Debug, Clone)]
pub enum ProvisionMode {
    /// Ask the key generator for a fresh pair.
    Generate,
    /// Operator-supplied input; either the bare secret line or a pasted key file.
    Import(Zeroizing<String>),
}

/// How to treat a key file that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Refuse to touch an existing file.
    #[default]
    CreateNew,
    /// Replace the existing file.
    Overwrite,
    /// Keep existing identities and add the new one after them.
    Append,
}

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub mode: ProvisionMode,
    pub write: WriteMode,
}

impl ProvisionRequest {
    pub fn generate(write: WriteMode) -> Self {
        Self {
            mode: ProvisionMode::Generate,
            write,
        }
    }

    pub fn import(input: impl Into<String>, write: WriteMode) -> Self {
        Self {
            mode: ProvisionMode::Import(Zeroizing::new(input.into())),
            write,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    pub public_key: String,
    pub key_path: PathBuf,
    /// False when the identity was already present and nothing was written.
    pub written: bool,
    pub report: WorkflowReport,
}

struct Identity {
    secret: Zeroizing<String>,
    public_key: String,
}

/// Guarantee that a valid identity is stored at `location` and return its recipient.
///
/// The key file only ever changes through a single atomic publish of a fully
/// written temp file; any failure before that leaves the location untouched.
pub fn ensure_key<G>(
    location: &KeyStoreLocation,
    generator: &G,
    request: ProvisionRequest,
) -> SopskeyResult<ProvisionOutcome>
where
    G: KeyGenerator + ?Sized,
{
    let key_path = location.key_path.clone();
    let mut report = WorkflowReport::new(match request.mode {
        ProvisionMode::Generate => "Generate age key",
        ProvisionMode::Import(_) => "Import age key",
    });
    report.push(
        WorkflowLevel::Info,
        format!(
            "Key file: {} (from {})",
            key_path.display(),
            location.source.describe()
        ),
    );

    if request.write == WriteMode::CreateNew && key_file_exists(&key_path)? {
        return Err(SopskeyError::Conflict { path: key_path });
    }

    let identity = match &request.mode {
        ProvisionMode::Import(input) => import_identity(generator, input)?,
        ProvisionMode::Generate => generate_identity(generator)?,
    };

    for created in ensure_private_dir(location.parent())? {
        report.push(
            WorkflowLevel::Info,
            format!("Created directory {} (mode 0700)", created.display()),
        );
    }

    let block = compose_identity_block(&identity.secret, &identity.public_key, Utc::now());
    let contents = match request.write {
        WriteMode::CreateNew => {
            if key_file_exists(&key_path)? {
                return Err(SopskeyError::Conflict { path: key_path });
            }
            block
        }
        WriteMode::Overwrite => {
            if key_file_exists(&key_path)? {
                report.push(
                    WorkflowLevel::Warn,
                    "Replacing the existing key file; identities it held are no longer stored here.",
                );
            }
            block
        }
        WriteMode::Append => match read_identity_file(&key_path)? {
            Some(current) => {
                if contains_secret(&current, &identity.secret) {
                    info!("identity already present in {}", key_path.display());
                    report.push(
                        WorkflowLevel::Info,
                        "Key already present in the key file; no changes made.",
                    );
                    return Ok(ProvisionOutcome {
                        public_key: identity.public_key,
                        key_path,
                        written: false,
                        report,
                    });
                }
                append_identity_block(&current, &block)
            }
            None => block,
        },
    };

    let staged = stage_file(&key_path, contents.as_bytes(), KEY_FILE_MODE)?;
    debug!(
        "staged key material at {} for {}",
        staged.path().display(),
        staged.destination().display()
    );
    verify_staged(&staged, &identity.secret)?;

    match request.write {
        WriteMode::CreateNew => staged.publish_new()?,
        WriteMode::Overwrite | WriteMode::Append => staged.publish()?,
    }

    info!("installed age identity at {}", key_path.display());
    report.push(
        WorkflowLevel::Security,
        format!(
            "Installed key to {} (mode {:04o})",
            key_path.display(),
            KEY_FILE_MODE
        ),
    );

    Ok(ProvisionOutcome {
        public_key: identity.public_key,
        key_path,
        written: true,
        report,
    })
}

/// Presence check that does not follow symlinks or read the file.
fn key_file_exists(path: &Path) -> SopskeyResult<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Read the staged copy back and confirm it holds `secret` before it is published.
pub(super) fn verify_staged(staged: &StagedFile, secret: &str) -> SopskeyResult<()> {
    let readback = Zeroizing::new(fs::read_to_string(staged.path())?);
    if !contains_secret(&readback, secret) {
        return Err(SopskeyError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "staged key file did not read back the expected identity",
        )));
    }
    Ok(())
}

fn generate_identity<G>(generator: &G) -> SopskeyResult<Identity>
where
    G: KeyGenerator + ?Sized,
{
    let generated = generator.generate()?;
    validate_secret_key(&generated.secret).map_err(|err| {
        SopskeyError::Generation(format!("generator returned an unusable secret key: {err}"))
    })?;

    let derived = derive_checked(generator, &generated.secret)?;
    if derived != generated.public_key.trim() {
        return Err(SopskeyError::Generation(format!(
            "generated public key {} does not match the key derived from its secret ({derived})",
            generated.public_key.trim()
        )));
    }

    Ok(Identity {
        secret: generated.secret,
        public_key: derived,
    })
}

fn import_identity<G>(generator: &G, input: &str) -> SopskeyResult<Identity>
where
    G: KeyGenerator + ?Sized,
{
    let line = extract_secret_key_line(input).ok_or_else(|| {
        SopskeyError::Validation(
            "did not detect a line starting with `AGE-SECRET-KEY-`".into(),
        )
    })?;
    validate_secret_key(line)?;
    let public_key = derive_checked(generator, line)?;

    Ok(Identity {
        secret: Zeroizing::new(line.to_string()),
        public_key,
    })
}

fn derive_checked<G>(generator: &G, secret: &str) -> SopskeyResult<String>
where
    G: KeyGenerator + ?Sized,
{
    let derived = generator.derive_public(secret)?;
    let derived = derived.trim().to_string();
    if !looks_like_public_key(&derived) {
        return Err(SopskeyError::Generation(format!(
            "derived public key `{derived}` is not an age recipient"
        )));
    }
    Ok(derived)
}
