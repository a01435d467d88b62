//! Ed25519 server signing key management.
//!
//! The sender holds one Ed25519 key pair for the life of the process and uses
//! it to sign every outbound transaction. Remote servers verify the signature
//! against the public key advertised by the homeserver core's key endpoint.
//!
//! # Key IDs
//! Key IDs follow the Matrix convention: `ed25519:<fingerprint>`, where the
//! fingerprint is the first 6 bytes of the public key, hex-encoded.
//!
//! # Storage
//! The key lives in a single-line text file (path from config):
//!
//! ```text
//! ed25519 <fingerprint> <unpadded-base64 seed>
//! ```
//!
//! On first run the file is created with a freshly generated pair.

use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use std::path::Path;
use tracing::{info, warn};

use crate::error::FederationError;

const ALGORITHM: &str = "ed25519";

/// This server's Ed25519 signing identity. Immutable for the process
/// lifetime; the single source of truth for all outbound signatures.
pub struct SigningKeyPair {
    /// Key ID in the format `ed25519:<12-char-hex>`.
    pub key_id: String,
    signing_key: SigningKey,
}

impl SigningKeyPair {
    /// Generate a brand-new random Ed25519 key pair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let key_id = derive_key_id(signing_key.verifying_key().as_bytes());
        Self { key_id, signing_key }
    }

    /// Reconstruct a key pair from raw 32-byte seed bytes.
    pub fn from_seed(seed: &[u8]) -> Result<Self, FederationError> {
        let bytes: [u8; 32] = seed
            .try_into()
            .map_err(|_| FederationError::KeyLoad("seed must be exactly 32 bytes".into()))?;
        let signing_key = SigningKey::from_bytes(&bytes);
        let key_id = derive_key_id(signing_key.verifying_key().as_bytes());
        Ok(Self { key_id, signing_key })
    }

    /// Load the signing key from `path`, or generate and persist a new one if
    /// the file does not exist yet.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, FederationError> {
        let path = path.as_ref();
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let kp = Self::parse_key_file(contents.trim())?;
            info!(key_id = %kp.key_id, "Loaded federation signing key");
            return Ok(kp);
        }

        warn!(path = %path.display(), "No signing key file found, generating a new Ed25519 key pair");
        let kp = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let seed_b64 =
            base64::engine::general_purpose::STANDARD_NO_PAD.encode(kp.signing_key.to_bytes());
        let fingerprint = kp.key_id.split(':').nth(1).unwrap_or_default();
        std::fs::write(path, format!("{ALGORITHM} {fingerprint} {seed_b64}\n"))?;
        info!(key_id = %kp.key_id, "Generated and persisted new signing key");
        Ok(kp)
    }

    fn parse_key_file(line: &str) -> Result<Self, FederationError> {
        let mut parts = line.split_whitespace();
        let algorithm = parts.next().ok_or_else(|| bad_key_file("missing algorithm"))?;
        if algorithm != ALGORITHM {
            return Err(bad_key_file(&format!("unsupported algorithm '{algorithm}'")));
        }
        let _fingerprint = parts.next().ok_or_else(|| bad_key_file("missing fingerprint"))?;
        let seed_b64 = parts.next().ok_or_else(|| bad_key_file("missing seed"))?;
        let seed = base64::engine::general_purpose::STANDARD_NO_PAD
            .decode(seed_b64)
            .map_err(|e| bad_key_file(&format!("seed is not valid base64: {e}")))?;
        Self::from_seed(&seed)
    }

    /// The signature algorithm tag (`ed25519`).
    pub fn algorithm(&self) -> &'static str {
        ALGORITHM
    }

    /// Return the public verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Return the public key as an unpadded-base64 string.
    pub fn public_key_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD_NO_PAD
            .encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Sign arbitrary bytes and return the unpadded-base64 signature.
    pub fn sign_bytes(&self, bytes: &[u8]) -> String {
        let sig = self.signing_key.sign(bytes);
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(sig.to_bytes())
    }
}

fn bad_key_file(reason: &str) -> FederationError {
    FederationError::KeyLoad(format!("malformed key file: {reason}"))
}

/// Derive a stable key ID from raw public key bytes.
fn derive_key_id(pubkey_bytes: &[u8]) -> String {
    let fingerprint = hex::encode(&pubkey_bytes[..6]);
    format!("{ALGORITHM}:{fingerprint}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    fn temp_key_path(tag: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("hearth-keys-{tag}-{}-{nanos}", std::process::id()))
    }

    #[test]
    fn round_trip_sign_verify() {
        let kp = SigningKeyPair::generate();
        let msg = b"hello hearth federation";
        let sig_b64 = kp.sign_bytes(msg);

        let sig_bytes = base64::engine::general_purpose::STANDARD_NO_PAD.decode(sig_b64).unwrap();
        let sig = ed25519_dalek::Signature::from_bytes(sig_bytes.as_slice().try_into().unwrap());
        kp.verifying_key().verify(msg, &sig).expect("signature should verify");
    }

    #[test]
    fn from_seed_is_stable() {
        let kp1 = SigningKeyPair::generate();
        let kp2 = SigningKeyPair::from_seed(&kp1.signing_key.to_bytes()).unwrap();
        assert_eq!(kp1.key_id, kp2.key_id);
        assert_eq!(kp1.public_key_base64(), kp2.public_key_base64());
    }

    #[test]
    fn load_or_generate_persists_and_reloads() {
        let path = temp_key_path("reload");
        let kp1 = SigningKeyPair::load_or_generate(&path).unwrap();
        let kp2 = SigningKeyPair::load_or_generate(&path).unwrap();
        assert_eq!(kp1.key_id, kp2.key_id);
        assert_eq!(kp1.public_key_base64(), kp2.public_key_base64());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn rejects_garbage_key_file() {
        let path = temp_key_path("garbage");
        std::fs::write(&path, "rsa deadbeef not-base64!!!").unwrap();
        assert!(matches!(
            SigningKeyPair::load_or_generate(&path),
            Err(FederationError::KeyLoad(_))
        ));
        let _ = std::fs::remove_file(path);
    }
}
