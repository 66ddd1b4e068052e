//! Ed25519 keys, password hashing, and gateway-secret sealing.
//!
//! The gateway secret is encrypted at rest with AES-256-GCM under a key
//! derived from machine identity via PBKDF2-HMAC-SHA256 (100k iterations).
//! On-disk layout: `salt(32) || nonce(12) || ciphertext || tag(16)`.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use fabric_contracts::AuthorityError;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_PURPOSE: &str = "gateway-secret-encryption";
// Pre-salt blobs were sealed under this fixed salt.
const LEGACY_SALT: &[u8] = b"fabric-gateway-encryption-salt";

fn crypto_err(context: &str) -> AuthorityError {
    AuthorityError::Crypto(context.to_string())
}

/// Generate an Ed25519 keypair. Returns `(pkcs8_document, raw_public_key)`.
pub fn generate_keypair() -> Result<(Vec<u8>, Vec<u8>), AuthorityError> {
    let rng = SystemRandom::new();
    let document = Ed25519KeyPair::generate_pkcs8(&rng)
        .map_err(|_| crypto_err("keypair generation failed"))?;
    let pair = Ed25519KeyPair::from_pkcs8(document.as_ref())
        .map_err(|_| crypto_err("generated key did not parse"))?;
    Ok((document.as_ref().to_vec(), pair.public_key().as_ref().to_vec()))
}

/// Sign `data` with a pkcs8-encoded Ed25519 key; returns base64.
pub fn sign_data(pkcs8: &[u8], data: &[u8]) -> Result<String, AuthorityError> {
    let pair =
        Ed25519KeyPair::from_pkcs8(pkcs8).map_err(|_| crypto_err("invalid private key"))?;
    Ok(STANDARD.encode(pair.sign(data).as_ref()))
}

/// Verify a base64 Ed25519 signature against a raw 32-byte public key.
pub fn verify_signature(public_key: &[u8], data: &[u8], signature_b64: &str) -> bool {
    let Ok(signature) = STANDARD.decode(signature_b64) else {
        return false;
    };
    UnparsedPublicKey::new(&ED25519, public_key).verify(data, &signature).is_ok()
}

/// Encode a public key as base64url without padding.
pub fn encode_public_key(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode a base64url public key, tolerating stray padding.
pub fn decode_public_key(encoded: &str) -> Result<Vec<u8>, AuthorityError> {
    URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|_| AuthorityError::Validation(format!("invalid public key encoding: {}", encoded)))
}

/// `n` bytes from the system RNG.
pub fn random_bytes(n: usize) -> Result<Vec<u8>, AuthorityError> {
    let mut out = vec![0u8; n];
    SystemRandom::new().fill(&mut out).map_err(|_| crypto_err("rng failure"))?;
    Ok(out)
}

/// Six uppercase hex characters from a cryptographically random 3-byte draw.
pub fn wa_id_suffix() -> Result<String, AuthorityError> {
    let bytes = random_bytes(3)?;
    Ok(bytes.iter().map(|b| format!("{:02X}", b)).collect())
}

pub fn sha256_hex(data: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, data);
    digest.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
}

/// PBKDF2 password hash, stored as `base64(salt(32) || derived_key(32))`.
pub fn hash_password(password: &str) -> Result<String, AuthorityError> {
    let salt = random_bytes(SALT_LEN)?;
    let mut key = [0u8; 32];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        NonZeroU32::new(PBKDF2_ITERATIONS).expect("non-zero"),
        &salt,
        password.as_bytes(),
        &mut key,
    );
    let mut stored = salt;
    stored.extend_from_slice(&key);
    Ok(STANDARD.encode(stored))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(decoded) = STANDARD.decode(hash) else {
        return false;
    };
    if decoded.len() != SALT_LEN + 32 {
        return false;
    }
    let (salt, stored_key) = decoded.split_at(SALT_LEN);
    pbkdf2::verify(
        pbkdf2::PBKDF2_HMAC_SHA256,
        NonZeroU32::new(PBKDF2_ITERATIONS).expect("non-zero"),
        salt,
        password.as_bytes(),
        stored_key,
    )
    .is_ok()
}

/// Manages the gateway secret on disk.
pub struct SecretStore {
    key_dir: PathBuf,
}

impl SecretStore {
    pub fn new(key_dir: impl Into<PathBuf>) -> Self {
        Self { key_dir: key_dir.into() }
    }

    /// Load the gateway secret, upgrading legacy formats on first read; a
    /// fresh 32-byte secret is generated when none exists.
    pub fn load_or_create_gateway_secret(&self) -> Result<Vec<u8>, AuthorityError> {
        std::fs::create_dir_all(&self.key_dir)
            .map_err(|e| AuthorityError::Storage(format!("key dir: {}", e)))?;
        let plain_path = self.key_dir.join("gateway.secret");
        let encrypted_path = self.key_dir.join("gateway.secret.enc");

        if encrypted_path.exists() {
            match std::fs::read(&encrypted_path) {
                Ok(blob) => match self.decrypt(&blob) {
                    Ok(secret) => return Ok(secret),
                    Err(e) => warn!("Failed to decrypt gateway secret ({}), regenerating", e),
                },
                Err(e) => warn!("Failed to read gateway secret ({}), regenerating", e),
            }
        }

        // Legacy unencrypted secret is upgraded and removed.
        if plain_path.exists() {
            let secret = std::fs::read(&plain_path)
                .map_err(|e| AuthorityError::Storage(format!("legacy secret: {}", e)))?;
            self.write_encrypted(&encrypted_path, &secret)?;
            let _ = std::fs::remove_file(&plain_path);
            info!("Upgraded legacy gateway secret to encrypted storage");
            return Ok(secret);
        }

        let secret = random_bytes(32)?;
        self.write_encrypted(&encrypted_path, &secret)?;
        Ok(secret)
    }

    fn write_encrypted(&self, path: &Path, secret: &[u8]) -> Result<(), AuthorityError> {
        let blob = self.encrypt(secret)?;
        std::fs::write(path, blob)
            .map_err(|e| AuthorityError::Storage(format!("write secret: {}", e)))?;
        restrict_permissions(path)?;
        Ok(())
    }

    /// Derive the sealing key from `machine-id:hostname:<purpose>`.
    fn derive_key(&self, salt: &[u8]) -> [u8; 32] {
        let machine_id = std::fs::read_to_string("/etc/machine-id")
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let hostname = if machine_id.is_empty() {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "default".to_string())
        } else {
            String::new()
        };
        let material = format!("{}:{}:{}", machine_id, hostname, KEY_PURPOSE);

        let mut key = [0u8; 32];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            NonZeroU32::new(PBKDF2_ITERATIONS).expect("non-zero"),
            salt,
            material.as_bytes(),
            &mut key,
        );
        key
    }

    pub(crate) fn encrypt(&self, secret: &[u8]) -> Result<Vec<u8>, AuthorityError> {
        let salt = random_bytes(SALT_LEN)?;
        let nonce_bytes = random_bytes(NONCE_LEN)?;
        let key = self.derive_key(&salt);

        let sealing = LessSafeKey::new(
            UnboundKey::new(&AES_256_GCM, &key).map_err(|_| crypto_err("bad AES key"))?,
        );
        let nonce = Nonce::try_assume_unique_for_key(&nonce_bytes)
            .map_err(|_| crypto_err("bad nonce"))?;

        let mut in_out = secret.to_vec();
        sealing
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| crypto_err("seal failed"))?;

        let mut blob = salt;
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&in_out);
        Ok(blob)
    }

    pub(crate) fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, AuthorityError> {
        // Pre-salt blobs lack the leading 32 bytes; probe by total length.
        if blob.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
            if blob.len() < NONCE_LEN + TAG_LEN {
                return Err(crypto_err("encrypted blob too short"));
            }
            let key = self.derive_key(LEGACY_SALT);
            return self.open(&key, &blob[..NONCE_LEN], &blob[NONCE_LEN..]);
        }

        let key = self.derive_key(&blob[..SALT_LEN]);
        self.open(&key, &blob[SALT_LEN..SALT_LEN + NONCE_LEN], &blob[SALT_LEN + NONCE_LEN..])
    }

    fn open(
        &self,
        key: &[u8; 32],
        nonce_bytes: &[u8],
        ciphertext_and_tag: &[u8],
    ) -> Result<Vec<u8>, AuthorityError> {
        let opening = LessSafeKey::new(
            UnboundKey::new(&AES_256_GCM, key).map_err(|_| crypto_err("bad AES key"))?,
        );
        let nonce =
            Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| crypto_err("bad nonce"))?;
        let mut in_out = ciphertext_and_tag.to_vec();
        let plaintext = opening
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| crypto_err("decryption failed"))?;
        Ok(plaintext.to_vec())
    }
}

/// Mode 0600 for key material.
pub fn restrict_permissions(path: &Path) -> Result<(), AuthorityError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| AuthorityError::Storage(format!("chmod: {}", e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let (pkcs8, public) = generate_keypair().unwrap();
        assert_eq!(public.len(), 32);

        let signature = sign_data(&pkcs8, b"payload").unwrap();
        assert!(verify_signature(&public, b"payload", &signature));
        assert!(!verify_signature(&public, b"tampered", &signature));
    }

    #[test]
    fn public_key_encoding_round_trips_and_tolerates_padding() {
        let (_, public) = generate_keypair().unwrap();
        let encoded = encode_public_key(&public);
        assert!(!encoded.contains('='));
        assert_eq!(decode_public_key(&encoded).unwrap(), public);
        assert_eq!(decode_public_key(&format!("{}==", encoded)).unwrap(), public);
    }

    #[test]
    fn password_hashing_verifies_and_rejects() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
        assert!(!verify_password("hunter2", "not-base64!!"));
    }

    #[test]
    fn gateway_secret_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::new(dir.path());

        let first = store.load_or_create_gateway_secret().unwrap();
        assert_eq!(first.len(), 32);
        let second = store.load_or_create_gateway_secret().unwrap();
        assert_eq!(first, second);

        let blob = std::fs::read(dir.path().join("gateway.secret.enc")).unwrap();
        assert_eq!(blob.len(), 32 + 12 + 32 + 16);
        assert_ne!(&blob[44..44 + 32], first.as_slice());
    }

    #[test]
    fn legacy_plaintext_secret_is_upgraded_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("gateway.secret");
        std::fs::write(&plain, [7u8; 32]).unwrap();

        let store = SecretStore::new(dir.path());
        let secret = store.load_or_create_gateway_secret().unwrap();
        assert_eq!(secret, vec![7u8; 32]);
        assert!(!plain.exists());
        assert!(dir.path().join("gateway.secret.enc").exists());

        assert_eq!(store.load_or_create_gateway_secret().unwrap(), vec![7u8; 32]);
    }

    #[test]
    fn wa_id_suffix_is_six_uppercase_hex() {
        let suffix = wa_id_suffix().unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }
}
