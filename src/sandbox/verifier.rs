// src/sandbox/verifier.rs
//! Module signature verification
//!
//! A module payload carries a detached ed25519 signature; it is accepted when
//! any key in the configured trust store validates it.

use crate::utils::errors::{EngineError, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use tracing::debug;

/// Trusted ed25519 verifying keys for module signatures
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    keys: Vec<VerifyingKey>,
}

impl TrustStore {
    pub fn new(keys: Vec<VerifyingKey>) -> Self {
        Self { keys }
    }

    /// Build a trust store from hex-encoded verifying keys (configuration form)
    pub fn from_hex_keys(encoded: &[String]) -> Result<Self> {
        let mut keys = Vec::with_capacity(encoded.len());
        for entry in encoded {
            let raw = hex::decode(entry).map_err(|e| {
                EngineError::ConfigFailed(format!("bad trust key hex: {}", e))
            })?;
            let raw: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
                EngineError::ConfigFailed(format!(
                    "trust key must be 32 bytes, got {}",
                    raw.len()
                ))
            })?;
            let key = VerifyingKey::from_bytes(&raw).map_err(|e| {
                EngineError::ConfigFailed(format!("invalid trust key: {}", e))
            })?;
            keys.push(key);
        }
        Ok(Self { keys })
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Verify a detached signature over the payload against any trusted key
    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<()> {
        let raw: [u8; 64] = signature.try_into().map_err(|_| {
            EngineError::VerificationFailed(format!(
                "signature must be 64 bytes, got {}",
                signature.len()
            ))
        })?;
        let signature = Signature::from_bytes(&raw);

        for key in &self.keys {
            if key.verify(payload, &signature).is_ok() {
                debug!("Module signature accepted");
                return Ok(());
            }
        }

        Err(EngineError::VerificationFailed(
            "signature does not validate against any trusted key".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn keypair() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    #[test]
    fn test_verify_accepts_trusted_signature() {
        let signer = keypair();
        let store = TrustStore::new(vec![signer.verifying_key()]);

        let payload = b"module payload";
        let signature = signer.sign(payload).to_bytes().to_vec();
        assert!(store.verify(payload, &signature).is_ok());
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let signer = keypair();
        let store = TrustStore::new(vec![signer.verifying_key()]);

        let signature = signer.sign(b"module payload").to_bytes().to_vec();
        let err = store.verify(b"other payload", &signature).unwrap_err();
        assert!(matches!(err, EngineError::VerificationFailed(_)));
    }

    #[test]
    fn test_verify_rejects_untrusted_key() {
        let signer = keypair();
        let other = SigningKey::from_bytes(&[9u8; 32]);
        let store = TrustStore::new(vec![other.verifying_key()]);

        let payload = b"module payload";
        let signature = signer.sign(payload).to_bytes().to_vec();
        assert!(store.verify(payload, &signature).is_err());
    }

    #[test]
    fn test_verify_rejects_short_signature() {
        let store = TrustStore::new(vec![keypair().verifying_key()]);
        let err = store.verify(b"payload", &[0u8; 12]).unwrap_err();
        assert!(matches!(err, EngineError::VerificationFailed(_)));
    }

    #[test]
    fn test_from_hex_keys() {
        let signer = keypair();
        let encoded = hex::encode(signer.verifying_key().to_bytes());
        let store = TrustStore::from_hex_keys(&[encoded]).unwrap();
        assert!(!store.is_empty());

        let err = TrustStore::from_hex_keys(&["zz".to_string()]).unwrap_err();
        assert!(matches!(err, EngineError::ConfigFailed(_)));
    }
}
