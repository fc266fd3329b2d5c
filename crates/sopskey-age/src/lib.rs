#![forbid(unsafe_code)]

//! age integration for sopskey.
//!
//! Talks to the host via `age-keygen` (generate a key pair, `-y` to derive the
//! recipient of an existing secret).

mod command;
mod system;

pub use system::{resolve_age_keygen_path, SystemAgeKeygen, DEFAULT_AGE_KEYGEN_PATHS};
