/// Keypairs for test identities
///
/// Both halves serialize to small JSON objects so they can be stored as
/// account fields and handed to the IdP for certification.

use crate::crypto::KeyAlgorithm;
use crate::error::{PtuError, PtuResult};
use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Public half; `point` is the hex SEC1 compressed point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub algorithm: KeyAlgorithm,
    pub keysize: u32,
    pub point: String,
}

/// Secret half; `d` is the hex scalar
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey {
    pub algorithm: KeyAlgorithm,
    pub keysize: u32,
    pub d: String,
}

impl PublicKey {
    pub fn serialize(&self) -> PtuResult<String> {
        serde_json::to_string(self)
            .map_err(|e| PtuError::Signing(format!("Failed to serialize public key: {}", e)))
    }

    pub fn parse(raw: &str) -> PtuResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| PtuError::Signing(format!("Invalid stored public key: {}", e)))
    }

    /// Short identifier used as the assertion `kid`
    pub fn key_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.point.as_bytes());
        hex::encode(&hasher.finalize()[..8])
    }

    pub fn verifying_key(&self) -> PtuResult<VerifyingKey> {
        let bytes = hex::decode(&self.point)
            .map_err(|e| PtuError::Signing(format!("Invalid hex public key: {}", e)))?;
        VerifyingKey::from_sec1_bytes(&bytes)
            .map_err(|e| PtuError::Signing(format!("Invalid public key: {}", e)))
    }
}

impl SecretKey {
    pub fn serialize(&self) -> PtuResult<String> {
        serde_json::to_string(self)
            .map_err(|e| PtuError::Signing(format!("Failed to serialize secret key: {}", e)))
    }

    pub fn parse(raw: &str) -> PtuResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| PtuError::Signing(format!("Invalid stored secret key: {}", e)))
    }
}

/// A signing key together with its algorithm
#[derive(Clone)]
pub struct KeyPair {
    algorithm: KeyAlgorithm,
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a fresh keypair from OS-seeded randomness
    pub fn generate(algorithm: KeyAlgorithm) -> PtuResult<Self> {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);

        let secret = k256::SecretKey::from_slice(&bytes)
            .map_err(|e| PtuError::Signing(format!("Failed to generate key: {}", e)))?;

        Ok(Self {
            algorithm,
            signing_key: SigningKey::from(secret),
        })
    }

    /// Rebuild from both stored halves, checking they belong together
    pub fn from_stored(public: &str, secret: &str) -> PtuResult<Self> {
        let public = PublicKey::parse(public)?;
        let pair = Self::from_secret(&SecretKey::parse(secret)?)?;

        if pair.public_key() != public {
            return Err(PtuError::Signing(
                "Stored public key does not match secret key".to_string(),
            ));
        }

        Ok(pair)
    }

    pub fn from_secret(secret: &SecretKey) -> PtuResult<Self> {
        let bytes = hex::decode(&secret.d)
            .map_err(|e| PtuError::Signing(format!("Invalid hex secret key: {}", e)))?;

        if bytes.len() != 32 {
            return Err(PtuError::Signing(
                "Secret key must be exactly 32 bytes".to_string(),
            ));
        }

        let secret_key = k256::SecretKey::from_slice(&bytes)
            .map_err(|e| PtuError::Signing(format!("Invalid secret key: {}", e)))?;

        Ok(Self {
            algorithm: secret.algorithm,
            signing_key: SigningKey::from(secret_key),
        })
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn public_key(&self) -> PublicKey {
        let point = self.signing_key.verifying_key().to_encoded_point(true);
        PublicKey {
            algorithm: self.algorithm,
            keysize: self.algorithm.keysize(),
            point: hex::encode(point.as_bytes()),
        }
    }

    pub fn secret_key(&self) -> SecretKey {
        SecretKey {
            algorithm: self.algorithm,
            keysize: self.algorithm.keysize(),
            d: hex::encode(self.signing_key.to_bytes()),
        }
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.algorithm)
            .field("public", &self.public_key().point)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_produces_distinct_keys() {
        let a = KeyPair::generate(KeyAlgorithm::Es256k).unwrap();
        let b = KeyPair::generate(KeyAlgorithm::Es256k).unwrap();
        assert_ne!(a.public_key(), b.public_key());

        // Compressed secp256k1 point
        assert_eq!(a.public_key().point.len(), 66);
        assert_eq!(a.secret_key().d.len(), 64);
    }

    #[test]
    fn test_stored_halves_restore_pair() {
        let pair = KeyPair::generate(KeyAlgorithm::Es256k).unwrap();
        let public = pair.public_key().serialize().unwrap();
        let secret = pair.secret_key().serialize().unwrap();

        assert!(public.contains("\"algorithm\":\"ES256K\""));

        let restored = KeyPair::from_stored(&public, &secret).unwrap();
        assert_eq!(restored.public_key(), pair.public_key());
    }

    #[test]
    fn test_mismatched_halves_rejected() {
        let a = KeyPair::generate(KeyAlgorithm::Es256k).unwrap();
        let b = KeyPair::generate(KeyAlgorithm::Es256k).unwrap();

        let result = KeyPair::from_stored(
            &a.public_key().serialize().unwrap(),
            &b.secret_key().serialize().unwrap(),
        );
        match result {
            Err(PtuError::Signing(_)) => {}
            _ => panic!("Expected Signing error"),
        }
    }

    #[test]
    fn test_invalid_secret_length() {
        let secret = SecretKey {
            algorithm: KeyAlgorithm::Es256k,
            keysize: 256,
            d: "abcd".to_string(),
        };
        assert!(KeyPair::from_secret(&secret).is_err());
    }

    #[test]
    fn test_public_key_round_trips_to_verifying_key() {
        let pair = KeyPair::generate(KeyAlgorithm::Es256k).unwrap();
        let verifying = pair.public_key().verifying_key().unwrap();
        assert_eq!(&verifying, pair.signing_key().verifying_key());
        assert_eq!(pair.public_key().key_id().len(), 16);
    }
}
