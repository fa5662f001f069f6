/// Key management and assertion signing
///
/// Handles secp256k1 keypairs for test identities and the signed
/// assertions presented to relying parties.

pub mod assertion;
pub mod keys;

pub use assertion::{bundle, sign_assertion, split_bundle, verify_assertion};
pub use keys::{KeyPair, PublicKey, SecretKey};

use crate::error::{PtuError, PtuResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Signing algorithms the issuer can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// ECDSA over secp256k1 with SHA-256
    #[serde(rename = "ES256K")]
    Es256k,
}

impl KeyAlgorithm {
    /// Resolve a configured algorithm name and key size
    pub fn from_config(algorithm: &str, keysize: u32) -> PtuResult<Self> {
        match (algorithm.to_ascii_uppercase().as_str(), keysize) {
            ("ES256K", 256) => Ok(KeyAlgorithm::Es256k),
            (name, size) => Err(PtuError::Validation(format!(
                "Unsupported assertion algorithm {} with keysize {}",
                name, size
            ))),
        }
    }

    /// JWS `alg` header value
    pub fn jws_name(&self) -> &'static str {
        match self {
            KeyAlgorithm::Es256k => "ES256K",
        }
    }

    pub fn keysize(&self) -> u32 {
        match self {
            KeyAlgorithm::Es256k => 256,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.jws_name())
    }
}
