//! # Payload Signing
//!
//! Two independent integrity mechanisms over the canonical payload JSON:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Authority signature (sent as X-Signature)                              │
//! │  ─────────────────────────────────────────                              │
//! │    message   = canonical_json || device_secret || timestamp             │
//! │    signature = hex( RSA-PSS-SHA256(private_key, message) )              │
//! │                                                                         │
//! │  Internal checksum (stored on the invoice row, never sent)              │
//! │  ─────────────────────────────────────────────────────────              │
//! │    checksum  = hex( HMAC-SHA256(key = device_secret, canonical_json) )  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! PSS signatures are randomized: signing the same message twice gives two
//! different signatures that both verify.

use hmac::{Hmac, Mac};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::pss::{BlindedSigningKey, Signature, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::secret::write_owner_only;

type HmacSha256 = Hmac<Sha256>;

/// Key size used when the worker has to generate a keypair.
pub const DEFAULT_KEY_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Checksum key rejected: {0}")]
    Checksum(String),

    #[error("Key file error: {0}")]
    Io(#[from] std::io::Error),
}

/// RSA keypair that signs outgoing payloads.
#[derive(Clone)]
pub struct PayloadSigner {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl std::fmt::Debug for PayloadSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PayloadSigner(..)")
    }
}

impl PayloadSigner {
    pub fn from_private_key(private_key: RsaPrivateKey) -> Self {
        let public_key = RsaPublicKey::from(&private_key);
        PayloadSigner {
            private_key,
            public_key,
        }
    }

    /// Generates a fresh keypair.
    pub fn generate(bits: usize) -> Result<Self, SigningError> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| SigningError::KeyGeneration(e.to_string()))?;
        Ok(Self::from_private_key(private_key))
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// Signs `payload || secret || timestamp`; returns hex.
    pub fn sign(&self, payload_json: &str, secret: &str, timestamp: &str) -> String {
        let signing_key = BlindedSigningKey::<Sha256>::new(self.private_key.clone());
        let message = signing_message(payload_json, secret, timestamp);
        let signature = signing_key.sign_with_rng(&mut rand::thread_rng(), &message);
        hex::encode(signature.to_bytes())
    }

    /// Writes the keypair as PKCS#8 / SPKI PEM. The private key file is
    /// owner read/write only.
    pub fn save(&self, private_path: &Path, public_path: &Path) -> Result<(), SigningError> {
        let private_pem = self
            .private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        let public_pem = self
            .public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| SigningError::InvalidKey(e.to_string()))?;

        for path in [private_path, public_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        write_owner_only(private_path, private_pem.as_bytes())?;
        std::fs::write(public_path, public_pem)?;

        info!(?private_path, ?public_path, "Signing keypair saved");
        Ok(())
    }

    /// Loads a PKCS#8 PEM private key.
    pub fn load(private_path: &Path) -> Result<Self, SigningError> {
        let pem = std::fs::read_to_string(private_path)?;
        let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        Ok(Self::from_private_key(private_key))
    }

    /// Loads the keypair, generating and saving one if the private key file
    /// does not exist yet.
    pub fn load_or_generate(
        private_path: &Path,
        public_path: &Path,
        bits: usize,
    ) -> Result<Self, SigningError> {
        if private_path.exists() {
            return Self::load(private_path);
        }
        let signer = Self::generate(bits)?;
        signer.save(private_path, public_path)?;
        Ok(signer)
    }
}

/// Loads an SPKI PEM public key.
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, SigningError> {
    let pem = std::fs::read_to_string(path)?;
    RsaPublicKey::from_public_key_pem(&pem).map_err(|e| SigningError::InvalidKey(e.to_string()))
}

/// Checks a hex signature produced by [`PayloadSigner::sign`].
pub fn verify(
    payload_json: &str,
    signature_hex: &str,
    public_key: &RsaPublicKey,
    secret: &str,
    timestamp: &str,
) -> bool {
    let Ok(bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(bytes.as_slice()) else {
        return false;
    };
    let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
    verifying_key
        .verify(&signing_message(payload_json, secret, timestamp), &signature)
        .is_ok()
}

fn signing_message(payload_json: &str, secret: &str, timestamp: &str) -> Vec<u8> {
    let mut message = Vec::with_capacity(payload_json.len() + secret.len() + timestamp.len());
    message.extend_from_slice(payload_json.as_bytes());
    message.extend_from_slice(secret.as_bytes());
    message.extend_from_slice(timestamp.as_bytes());
    message
}

// =============================================================================
// Internal checksum
// =============================================================================

/// HMAC-SHA256 of the canonical payload keyed by the device secret, as hex.
pub fn payload_checksum(payload_json: &str, secret: &str) -> Result<String, SigningError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SigningError::Checksum(e.to_string()))?;
    mac.update(payload_json.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time comparison against a stored checksum.
pub fn verify_checksum(payload_json: &str, secret: &str, expected_hex: &str) -> bool {
    let Ok(expected) = hex::decode(expected_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload_json.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_signer;

    const PAYLOAD: &str = r#"{"invoiceNumber":"INV-1","totalAmount":116000}"#;

    #[test]
    fn test_sign_and_verify() {
        let signer = test_signer();
        let sig = signer.sign(PAYLOAD, "cmc", "20240301120000");

        assert!(verify(PAYLOAD, &sig, signer.public_key(), "cmc", "20240301120000"));

        // Any change to the bound inputs breaks the signature
        assert!(!verify(PAYLOAD, &sig, signer.public_key(), "other", "20240301120000"));
        assert!(!verify(PAYLOAD, &sig, signer.public_key(), "cmc", "20240301120001"));
        assert!(!verify(r#"{"invoiceNumber":"INV-2"}"#, &sig, signer.public_key(), "cmc", "20240301120000"));
        assert!(!verify(PAYLOAD, "zz", signer.public_key(), "cmc", "20240301120000"));
    }

    #[test]
    fn test_signatures_are_randomized() {
        let signer = test_signer();
        let a = signer.sign(PAYLOAD, "cmc", "t");
        let b = signer.sign(PAYLOAD, "cmc", "t");
        assert_ne!(a, b);
        assert!(verify(PAYLOAD, &b, signer.public_key(), "cmc", "t"));
    }

    #[test]
    fn test_keypair_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let private_path = dir.path().join("signing.pem");
        let public_path = dir.path().join("signing.pub.pem");
        let signer = test_signer();
        signer.save(&private_path, &public_path).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&private_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = PayloadSigner::load(&private_path).unwrap();
        let public = load_public_key(&public_path).unwrap();
        let sig = loaded.sign(PAYLOAD, "cmc", "t");
        assert!(verify(PAYLOAD, &sig, &public, "cmc", "t"));
        assert_eq!(&public, signer.public_key());

        // Existing file is loaded, not replaced
        let again = PayloadSigner::load_or_generate(&private_path, &public_path, 1024).unwrap();
        assert_eq!(again.public_key(), signer.public_key());
    }

    #[test]
    fn test_checksum() {
        let sum = payload_checksum(PAYLOAD, "cmc").unwrap();
        assert_eq!(sum.len(), 64);
        assert_eq!(sum, payload_checksum(PAYLOAD, "cmc").unwrap());
        assert!(verify_checksum(PAYLOAD, "cmc", &sum));
        assert!(!verify_checksum(PAYLOAD, "other", &sum));
        assert!(!verify_checksum(r#"{"x":1}"#, "cmc", &sum));
        assert!(!verify_checksum(PAYLOAD, "cmc", "not-hex"));
    }
}
