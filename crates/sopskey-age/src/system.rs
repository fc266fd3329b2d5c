//! System-backed `KeyGenerator` implementation wrapping the host `age-keygen`.

use crate::command::AgeKeygenCommand;
use log::debug;
use sopskey_core::error::{SopskeyError, SopskeyResult};
use sopskey_core::keygen::{GeneratedIdentity, KeyGenerator};
use sopskey_core::SopskeyConfig;
use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const AGE_KEYGEN_BINARY: &str = "age-keygen";

/// Install locations checked when `age-keygen` is not on `PATH`.
pub const DEFAULT_AGE_KEYGEN_PATHS: &[&str] = &[
    "/usr/bin/age-keygen",
    "/usr/local/bin/age-keygen",
    "/opt/homebrew/bin/age-keygen",
    "/home/linuxbrew/.linuxbrew/bin/age-keygen",
];

/// Key generator that shells out to `age-keygen`.
#[derive(Debug, Clone)]
pub struct SystemAgeKeygen {
    command: AgeKeygenCommand,
}

impl SystemAgeKeygen {
    /// Build a generator from configuration, resolving the binary against `PATH`.
    pub fn from_config(config: &SopskeyConfig) -> SopskeyResult<Self> {
        let binary = resolve_age_keygen_path(
            config.keygen_binary_path().as_deref(),
            env::var_os("PATH").as_deref(),
        )?;
        debug!("using age-keygen at {}", binary.display());
        Ok(Self::with_binary(binary, config.keygen_timeout()))
    }

    /// Build a generator for an explicit binary path.
    pub fn with_binary(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: AgeKeygenCommand::new(binary.into(), timeout),
        }
    }

    pub fn binary(&self) -> &Path {
        self.command.binary()
    }
}

impl KeyGenerator for SystemAgeKeygen {
    fn generate(&self) -> SopskeyResult<GeneratedIdentity> {
        self.command.generate()
    }

    fn derive_public(&self, secret: &str) -> SopskeyResult<String> {
        self.command.derive_public(secret)
    }
}

/// Locate `age-keygen`: explicit override first, then `search_path`, then known install paths.
pub fn resolve_age_keygen_path(
    configured: Option<&Path>,
    search_path: Option<&OsStr>,
) -> SopskeyResult<PathBuf> {
    if let Some(candidate) = configured {
        if !candidate.is_file() {
            return Err(SopskeyError::KeygenUnavailable(format!(
                "keygen.binary points at {}, which does not exist",
                candidate.display()
            )));
        }
        return Ok(candidate.to_path_buf());
    }

    if let Some(found) = search_path.and_then(|paths| find_in_path(AGE_KEYGEN_BINARY, paths)) {
        return Ok(found);
    }

    DEFAULT_AGE_KEYGEN_PATHS
        .iter()
        .map(Path::new)
        .find(|candidate| candidate.is_file())
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            SopskeyError::KeygenUnavailable(format!(
                "`{AGE_KEYGEN_BINARY}` is not on PATH or in {:?}",
                DEFAULT_AGE_KEYGEN_PATHS
            ))
        })
}

fn find_in_path(binary: &str, paths: &OsStr) -> Option<PathBuf> {
    env::split_paths(paths).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            Some(candidate)
        } else {
            None
        }
    })
}
