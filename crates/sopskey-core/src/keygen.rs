//! Contract for the key generation capability.
//!
//! Concrete implementations live in `sopskey-age` (wrapping the host `age-keygen`
//! binary). Workflows only see this trait so they can be exercised with stubs.

use crate::error::SopskeyResult;
use zeroize::Zeroizing;

/// Fresh key pair produced by a generator.
#[derive(Debug, Clone)]
pub struct GeneratedIdentity {
    /// The `AGE-SECRET-KEY-1...` line.
    pub secret: Zeroizing<String>,
    /// Recipient reported alongside the secret.
    pub public_key: String,
}

pub trait KeyGenerator {
    /// Produce a brand new key pair. Output is never deterministic.
    fn generate(&self) -> SopskeyResult<GeneratedIdentity>;

    /// Derive the recipient for `secret`. Must be deterministic.
    fn derive_public(&self, secret: &str) -> SopskeyResult<String>;
}

impl<T> KeyGenerator for &T
where
    T: KeyGenerator + ?Sized,
{
    fn generate(&self) -> SopskeyResult<GeneratedIdentity> {
        (**self).generate()
    }

    fn derive_public(&self, secret: &str) -> SopskeyResult<String> {
        (**self).derive_public(secret)
    }
}
