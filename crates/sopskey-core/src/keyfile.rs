//! age identity file codec and atomic persistence helpers.
//!
//! The on-disk format matches what `age-keygen` emits: optional `# created:` and
//! `# public key:` comments followed by one `AGE-SECRET-KEY-1...` line per identity.
//! Multiple identities are separated by a blank line.

use crate::error::{SopskeyError, SopskeyResult};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

/// Marker that identifies secret key material.
pub const SECRET_KEY_MARKER: &str = "AGE-SECRET-KEY-";
/// Marker that identifies an age recipient.
pub const PUBLIC_KEY_MARKER: &str = "age1";
/// Permissions applied to key files.
pub const KEY_FILE_MODE: u32 = 0o600;
/// Permissions applied to directories created for key files.
pub const KEY_DIR_MODE: u32 = 0o700;

const SECRET_KEY_PREFIX: &str = "AGE-SECRET-KEY-1";
const BECH32_CHARSET: &str = "qpzry9x8gf2tvdw0s3jn54khce6mua7l";
const CREATED_COMMENT: &str = "# created:";
const PUBLIC_KEY_COMMENT: &str = "# public key:";

/// One identity parsed from a key file.
#[derive(Debug, Clone)]
pub struct IdentityBlock {
    pub created: Option<String>,
    pub public_key: Option<String>,
    pub secret: Zeroizing<String>,
}

/// Locate the secret key line in operator input.
///
/// Accepts either the bare key or a pasted key file; the first line carrying the
/// secret marker wins.
pub fn extract_secret_key_line(input: &str) -> Option<&str> {
    input
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with(SECRET_KEY_MARKER))
}

/// Check that `line` looks like an age secret key.
pub fn validate_secret_key(line: &str) -> SopskeyResult<()> {
    let trimmed = line.trim();
    let payload = trimmed.strip_prefix(SECRET_KEY_PREFIX).ok_or_else(|| {
        SopskeyError::Validation(format!(
            "expected a single line starting with `{SECRET_KEY_MARKER}`"
        ))
    })?;
    if payload.is_empty() {
        return Err(SopskeyError::Validation(
            "secret key is truncated after the marker".into(),
        ));
    }
    if let Some(bad) = payload.chars().find(|ch| !is_bech32_char(*ch)) {
        return Err(SopskeyError::Validation(format!(
            "secret key contains invalid character `{bad}`"
        )));
    }
    let has_upper = payload.chars().any(|ch| ch.is_ascii_uppercase());
    let has_lower = payload.chars().any(|ch| ch.is_ascii_lowercase());
    if has_upper && has_lower {
        return Err(SopskeyError::Validation(
            "secret key mixes upper and lower case".into(),
        ));
    }
    Ok(())
}

/// Lightweight sanity check for recipient strings returned by the key generator.
pub fn looks_like_public_key(candidate: &str) -> bool {
    match candidate.strip_prefix(PUBLIC_KEY_MARKER) {
        Some(payload) => {
            !payload.is_empty()
                && payload
                    .chars()
                    .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit())
                && payload.chars().all(is_bech32_char)
        }
        None => false,
    }
}

fn is_bech32_char(ch: char) -> bool {
    BECH32_CHARSET.contains(ch.to_ascii_lowercase())
}

/// Parse every identity out of a key file.
pub fn parse_identity_file(contents: &str) -> Vec<IdentityBlock> {
    let mut blocks = Vec::new();
    let mut created = None;
    let mut public_key = None;

    for line in contents.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix(CREATED_COMMENT) {
            created = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix(PUBLIC_KEY_COMMENT) {
            public_key = Some(value.trim().to_string());
        } else if line.starts_with(SECRET_KEY_MARKER) {
            blocks.push(IdentityBlock {
                created: created.take(),
                public_key: public_key.take(),
                secret: Zeroizing::new(line.to_string()),
            });
        }
    }

    blocks
}

/// Return true when `contents` already holds `secret`.
pub fn contains_secret(contents: &str, secret: &str) -> bool {
    let secret = secret.trim();
    parse_identity_file(contents)
        .iter()
        .any(|block| block.secret.as_str() == secret)
}

/// Render one identity block in the format `age-keygen` writes.
pub fn compose_identity_block(
    secret: &str,
    public_key: &str,
    created: DateTime<Utc>,
) -> Zeroizing<String> {
    Zeroizing::new(format!(
        "{CREATED_COMMENT} {}\n{PUBLIC_KEY_COMMENT} {}\n{}\n",
        created.to_rfc3339_opts(SecondsFormat::Secs, true),
        public_key.trim(),
        secret.trim()
    ))
}

/// Append `block` to existing key file contents, separated by a blank line.
pub fn append_identity_block(existing: &str, block: &str) -> Zeroizing<String> {
    let mut combined = Zeroizing::new(String::with_capacity(existing.len() + block.len() + 2));
    combined.push_str(existing);
    if !combined.is_empty() {
        if !combined.ends_with('\n') {
            combined.push('\n');
        }
        if !combined.ends_with("\n\n") {
            combined.push('\n');
        }
    }
    combined.push_str(block);
    combined
}

/// Read a key file, returning `None` when it does not exist.
pub fn read_identity_file(path: &Path) -> SopskeyResult<Option<Zeroizing<String>>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(Zeroizing::new(contents))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(SopskeyError::Io(err)),
    }
}

/// Create `dir` and any missing ancestors. Directories created here are
/// restricted to the owner; pre-existing ones are left alone.
pub fn ensure_private_dir(dir: &Path) -> SopskeyResult<Vec<PathBuf>> {
    let mut missing = Vec::new();
    let mut cursor = Some(dir);
    while let Some(candidate) = cursor {
        if candidate.as_os_str().is_empty() || candidate.exists() {
            break;
        }
        missing.push(candidate.to_path_buf());
        cursor = candidate.parent();
    }

    fs::create_dir_all(dir)?;

    for created in &missing {
        fs::set_permissions(created, fs::Permissions::from_mode(KEY_DIR_MODE))?;
    }
    missing.reverse();
    Ok(missing)
}

/// Contents written to a temp file beside the destination, not yet visible there.
///
/// Dropping a staged file without publishing removes the temp file, so a failure
/// between staging and publishing leaves nothing at the destination.
#[derive(Debug)]
pub struct StagedFile {
    temp: NamedTempFile,
    dest: PathBuf,
    parent: PathBuf,
}

impl StagedFile {
    /// Location of the staged temp file.
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Final destination after symlink resolution.
    pub fn destination(&self) -> &Path {
        &self.dest
    }

    /// Move the staged file into place, replacing whatever is there.
    pub fn publish(self) -> SopskeyResult<()> {
        let StagedFile { temp, dest, parent } = self;
        temp.persist(&dest)
            .map_err(|err| SopskeyError::Io(err.error))?;
        let _ = sync_parent_dir(&parent);
        Ok(())
    }

    /// Move the staged file into place only if nothing exists at the destination.
    pub fn publish_new(self) -> SopskeyResult<()> {
        let StagedFile { temp, dest, parent } = self;
        match temp.persist_noclobber(&dest) {
            Ok(_) => {
                let _ = sync_parent_dir(&parent);
                Ok(())
            }
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                Err(SopskeyError::Conflict { path: dest })
            }
            Err(err) => Err(SopskeyError::Io(err.error)),
        }
    }
}

/// Write `contents` to a temp file next to `path` with `mode` permissions.
///
/// When a file already exists at the destination its owner and group are carried
/// over to the staged copy.
pub fn stage_file(path: &Path, contents: &[u8], mode: u32) -> SopskeyResult<StagedFile> {
    let dest = resolve_write_path(path)?;
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    fs::create_dir_all(&parent)?;

    let ownership = fs::metadata(&dest)
        .ok()
        .map(|meta| (meta.uid(), meta.gid()));

    let mut temp = NamedTempFile::new_in(&parent)?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(mode))?;
    temp.as_file_mut().write_all(contents)?;
    temp.as_file_mut().flush()?;

    if let Some((uid, gid)) = ownership {
        let rc = unsafe { libc::fchown(temp.as_file().as_raw_fd(), uid, gid) };
        if rc != 0 {
            return Err(SopskeyError::Io(io::Error::last_os_error()));
        }
    }

    temp.as_file().sync_all()?;
    Ok(StagedFile { temp, dest, parent })
}

fn resolve_write_path(path: &Path) -> SopskeyResult<PathBuf> {
    let mut candidate = path.to_path_buf();
    for _ in 0..16 {
        let meta = match fs::symlink_metadata(&candidate) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(candidate),
            Err(err) => return Err(SopskeyError::Io(err)),
        };

        if !meta.file_type().is_symlink() {
            return Ok(candidate);
        }

        let target = fs::read_link(&candidate)?;
        candidate = if target.is_absolute() {
            target
        } else {
            candidate
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."))
                .join(target)
        };
    }

    Err(SopskeyError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("symlink resolution depth exceeded for {}", path.display()),
    )))
}

fn sync_parent_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir).and_then(|file| file.sync_all())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    const SECRET: &str = "AGE-SECRET-KEY-1QPZRY9X8GF2TVDW0S3JN54KHCE6MUA7LQPZRY9X8GF2TVDW0S3JN54KHC";
    const PUBLIC: &str = "age1qpzry9x8gf2tvdw0s3jn54khce6mua7lqpzry9x8gf2tvdw0s3jn54khc";

    fn entries(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect()
    }

    #[test]
    fn extract_accepts_bare_and_pasted_file() {
        assert_eq!(extract_secret_key_line(&format!("  {SECRET}\n")), Some(SECRET));
        let pasted = format!("# created: now\n# public key: {PUBLIC}\n{SECRET}\n");
        assert_eq!(extract_secret_key_line(&pasted), Some(SECRET));
        assert_eq!(extract_secret_key_line("age1abc"), None);
        assert_eq!(extract_secret_key_line(""), None);
    }

    #[test]
    fn validate_rejects_malformed_keys() {
        assert!(validate_secret_key(SECRET).is_ok());
        assert!(validate_secret_key("AGE-SECRET-KEY-1XYZ").is_ok());
        for bad in [
            "AGE-SECRET-KEY-1",
            "AGE-SECRET-KEY-2ABC",
            "AGE-SECRET-KEY-1ABC!",
            "AGE-SECRET-KEY-1QqP",
            "secret",
        ] {
            let err = validate_secret_key(bad).unwrap_err();
            assert!(matches!(err, SopskeyError::Validation(_)), "{bad}");
        }
    }

    #[test]
    fn public_key_check() {
        assert!(looks_like_public_key(PUBLIC));
        assert!(!looks_like_public_key("age1"));
        assert!(!looks_like_public_key("AGE1QPZ"));
        assert!(!looks_like_public_key("ssh-ed25519 AAAA"));
    }

    #[test]
    fn parse_attaches_comments_to_following_secret() {
        let second = "AGE-SECRET-KEY-1XYZ";
        let contents = format!(
            "# created: 2024-01-01T00:00:00Z\n# public key: {PUBLIC}\n{SECRET}\n\n{second}\n"
        );
        let blocks = parse_identity_file(&contents);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].public_key.as_deref(), Some(PUBLIC));
        assert_eq!(blocks[0].created.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(blocks[1].secret.as_str(), second);
        assert!(blocks[1].public_key.is_none());
        assert!(contains_secret(&contents, second));
        assert!(!contains_secret(&contents, "AGE-SECRET-KEY-1QQQ"));
    }

    #[test]
    fn compose_and_append_blocks() {
        let created = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let block = compose_identity_block(SECRET, PUBLIC, created);
        assert_eq!(
            block.as_str(),
            format!("# created: 2024-05-06T07:08:09Z\n# public key: {PUBLIC}\n{SECRET}\n")
        );

        let combined = append_identity_block("AGE-SECRET-KEY-1XYZ", &block);
        assert!(combined.starts_with("AGE-SECRET-KEY-1XYZ\n\n# created:"));
        assert_eq!(append_identity_block("", &block).as_str(), block.as_str());
        assert_eq!(parse_identity_file(&combined).len(), 2);
    }

    #[test]
    fn read_missing_file_is_none() {
        let dir = tempdir().unwrap();
        assert!(read_identity_file(&dir.path().join("keys.txt"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn ensure_private_dir_restricts_new_directories_only() {
        let dir = tempdir().unwrap();
        let before = fs::metadata(dir.path()).unwrap().permissions().mode() & 0o777;
        let target = dir.path().join("sops").join("age");
        let created = ensure_private_dir(&target).unwrap();
        assert_eq!(created, vec![dir.path().join("sops"), target.clone()]);
        for path in &created {
            let mode = fs::metadata(path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, KEY_DIR_MODE);
        }
        let after = fs::metadata(dir.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(before, after);
        assert!(ensure_private_dir(&target).unwrap().is_empty());
    }

    #[test]
    fn published_file_has_requested_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.txt");
        stage_file(&path, SECRET.as_bytes(), KEY_FILE_MODE)
            .unwrap()
            .publish()
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), SECRET);
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, KEY_FILE_MODE);
        assert_eq!(entries(dir.path()).len(), 1);
    }

    #[test]
    fn dropped_stage_leaves_no_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.txt");
        let staged = stage_file(&path, SECRET.as_bytes(), KEY_FILE_MODE).unwrap();
        assert!(staged.path().exists());
        drop(staged);
        assert!(!path.exists());
        assert!(entries(dir.path()).is_empty());
    }

    #[test]
    fn publish_new_refuses_existing_destination() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.txt");
        fs::write(&path, "original").unwrap();
        let staged = stage_file(&path, SECRET.as_bytes(), KEY_FILE_MODE).unwrap();
        let err = staged.publish_new().unwrap_err();
        assert!(matches!(err, SopskeyError::Conflict { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "original");
        assert_eq!(entries(dir.path()).len(), 1);
    }

    #[test]
    fn writes_follow_symlinks() {
        let dir = tempdir().unwrap();
        let real = dir.path().join("real.txt");
        let link = dir.path().join("keys.txt");
        fs::write(&real, "old").unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();
        stage_file(&link, b"new", KEY_FILE_MODE)
            .unwrap()
            .publish()
            .unwrap();
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(&real).unwrap(), "new");
    }
}
