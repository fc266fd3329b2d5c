//! Core building blocks shared by the sopskey binaries.
//!
//! Configuration, key file handling, and provisioning workflows live here so the
//! CLI only has to collect operator input and print reports.

pub mod config;
pub mod error;
pub mod keyfile;
pub mod keygen;
pub mod logging;
pub mod workflow;

pub use config::{ConfigFormat, Environment, KeyStoreLocation, LocationSource, SopskeyConfig};
pub use error::{ErrorKind, SopskeyError, SopskeyResult};
pub use keygen::{GeneratedIdentity, KeyGenerator};
pub use workflow::{
    ensure_key, ensure_policy_file, inspect_keystore, ProvisionMode, ProvisionOutcome,
    ProvisionRequest, WriteMode,
};
