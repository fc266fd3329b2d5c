//! Minimal `.sops.yaml` bootstrap.
//!
//! An existing policy file is never modified; operators own it after creation.

use super::{WorkflowLevel, WorkflowReport};
use crate::error::{SopskeyError, SopskeyResult};
use crate::keyfile::stage_file;
use log::info;
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::Path;

const POLICY_FILE_MODE: u32 = 0o644;
const POLICY_HEADER: &str = "# Managed by sopskey\n# Uses the age public key to encrypt files matched by creation_rules.\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOutcome {
    Created,
    ExistingReferencesKey,
    ExistingMissingKey,
}

#[derive(Serialize)]
struct PolicyDocument<'a> {
    creation_rules: Vec<CreationRule<'a>>,
}

#[derive(Serialize)]
struct CreationRule<'a> {
    path_regex: &'a str,
    age: &'a str,
}

/// Reject a `path_regex` that sops would not be able to compile.
pub fn check_path_regex(path_regex: &str) -> SopskeyResult<()> {
    Regex::new(path_regex).map(|_| ()).map_err(|err| {
        SopskeyError::InvalidConfig(format!("policy.path_regex is not a valid regex: {err}"))
    })
}

/// Render the policy document for a single recipient.
pub fn render_policy(public_key: &str, path_regex: &str) -> SopskeyResult<String> {
    check_path_regex(path_regex)?;
    let document = PolicyDocument {
        creation_rules: vec![CreationRule {
            path_regex,
            age: public_key.trim(),
        }],
    };
    let body = serde_yaml::to_string(&document)?;
    Ok(format!("{POLICY_HEADER}{body}"))
}

/// Create the policy file at `path` unless one already exists.
pub fn ensure_policy_file(
    path: &Path,
    public_key: &str,
    path_regex: &str,
) -> SopskeyResult<(PolicyOutcome, WorkflowReport)> {
    let mut report = WorkflowReport::new("Encryption policy");

    if path.exists() {
        let outcome = inspect_existing(path, public_key, &mut report)?;
        return Ok((outcome, report));
    }

    let rendered = render_policy(public_key, path_regex)?;
    if !publish_policy(path, &rendered)? {
        let outcome = inspect_existing(path, public_key, &mut report)?;
        return Ok((outcome, report));
    }

    info!("wrote encryption policy to {}", path.display());
    report.push(
        WorkflowLevel::Success,
        format!("SOPS config: {}", path.display()),
    );
    Ok((PolicyOutcome::Created, report))
}

/// Publish `rendered` at `path` without replacing anything. Returns false when a
/// file appeared there first.
pub(super) fn publish_policy(path: &Path, rendered: &str) -> SopskeyResult<bool> {
    match stage_file(path, rendered.as_bytes(), POLICY_FILE_MODE)?.publish_new() {
        Ok(()) => Ok(true),
        Err(SopskeyError::Conflict { .. }) => Ok(false),
        Err(err) => Err(err),
    }
}

fn inspect_existing(
    path: &Path,
    public_key: &str,
    report: &mut WorkflowReport,
) -> SopskeyResult<PolicyOutcome> {
    let current = fs::read_to_string(path)?;
    if current.contains(public_key.trim()) {
        report.push(
            WorkflowLevel::Info,
            format!("{} already lists this public key", path.display()),
        );
        Ok(PolicyOutcome::ExistingReferencesKey)
    } else {
        report.push(
            WorkflowLevel::Warn,
            format!(
                "{} exists but does not reference this public key; add it to creation_rules manually",
                path.display()
            ),
        );
        Ok(PolicyOutcome::ExistingMissingKey)
    }
}
