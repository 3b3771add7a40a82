//! Encrypted-at-rest key vault: file layout v1.
//!
//! `{ "version": "1.0", "salt": b64(16 B), "nonce": b64(12 B), "ciphertext":
//! b64(AES-256-GCM(Argon2id(password, salt), nonce, json(keys))) }`.
//!
//! Written with write-to-temp-then-rename durability.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit, OsRng as AesOsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;

use crate::error::{CoreError, Result};
use crate::keys::{KeyManager, OneTimePreKey, SignedPreKey};

const VAULT_VERSION: &str = "1.0";

#[derive(Serialize, Deserialize)]
struct VaultFile {
    version: String,
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// Everything needed to reconstruct a `KeyManager`, serialized as the
/// vault's plaintext payload.
#[derive(Serialize, Deserialize)]
struct VaultKeys {
    identity_secret: [u8; 32],
    signing_secret: [u8; 32],
    signed_prekey_id: u32,
    signed_prekey_secret: [u8; 32],
    signed_prekey_signature: [u8; 64],
    one_time_prekeys: Vec<(u32, [u8; 32])>,
    next_otk_id: u32,
}

impl VaultKeys {
    fn from_manager(mgr: &KeyManager) -> Self {
        Self {
            identity_secret: mgr.identity_secret().to_bytes(),
            signing_secret: mgr.signing_key().to_bytes(),
            signed_prekey_id: mgr.signed_prekey().id,
            signed_prekey_secret: mgr.signed_prekey().secret.to_bytes(),
            signed_prekey_signature: mgr.signed_prekey().signature,
            one_time_prekeys: mgr
                .one_time_prekeys()
                .values()
                .map(|otk| (otk.id, otk.secret.to_bytes()))
                .collect(),
            next_otk_id: mgr.next_otk_id(),
        }
    }

    fn into_manager(self) -> KeyManager {
        let identity_secret = StaticSecret::from(self.identity_secret);
        let signing_key = SigningKey::from_bytes(&self.signing_secret);
        let signed_prekey_secret = StaticSecret::from(self.signed_prekey_secret);
        let signed_prekey = SignedPreKey {
            id: self.signed_prekey_id,
            public: x25519_dalek::PublicKey::from(&signed_prekey_secret),
            secret: signed_prekey_secret,
            signature: self.signed_prekey_signature,
        };
        let one_time_prekeys: BTreeMap<u32, OneTimePreKey> = self
            .one_time_prekeys
            .into_iter()
            .map(|(id, secret_bytes)| {
                let secret = StaticSecret::from(secret_bytes);
                let public = x25519_dalek::PublicKey::from(&secret);
                (id, OneTimePreKey { id, secret, public })
            })
            .collect();
        KeyManager::from_parts(identity_secret, signing_key, signed_prekey, one_time_prekeys, self.next_otk_id)
    }
}

/// Write the key manager's material to an encrypted vault file at `path`,
/// via write-to-temp-then-rename for crash safety.
pub fn save(path: &Path, password: &str, mgr: &KeyManager) -> Result<()> {
    let salt = crate::crypto::random_bytes::<16>();
    let key = crate::crypto::argon2id_derive(password.as_bytes(), &salt)?;

    let plaintext = serde_json::to_vec(&VaultKeys::from_manager(mgr))
        .map_err(|e| CoreError::Storage(format!("vault serialize failed: {e}")))?;

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|_| CoreError::Crypto("bad vault key length".into()))?;
    let nonce = Aes256Gcm::generate_nonce(&mut AesOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_slice())
        .map_err(|_| CoreError::Crypto("vault encryption failed".into()))?;

    let file = VaultFile {
        version: VAULT_VERSION.to_string(),
        salt: B64.encode(salt),
        nonce: B64.encode(nonce),
        ciphertext: B64.encode(ciphertext),
    };
    let json = serde_json::to_vec_pretty(&file)
        .map_err(|e| CoreError::Storage(format!("vault serialize failed: {e}")))?;

    write_atomic(path, &json)
}

/// Load and decrypt a vault file. Returns `CoreError::Auth` on wrong
/// password (distinguishable from `CoreError::Storage` for a missing or
/// corrupt file) and never mutates the vault on failure; there is no
/// silent-regenerate path.
pub fn load(path: &Path, password: &str) -> Result<KeyManager> {
    let raw = fs::read(path).map_err(|e| CoreError::Storage(format!("vault read failed: {e}")))?;
    let file: VaultFile = serde_json::from_slice(&raw)
        .map_err(|e| CoreError::Storage(format!("vault corrupt: {e}")))?;
    if file.version != VAULT_VERSION {
        return Err(CoreError::Storage(format!("unsupported vault version {}", file.version)));
    }

    let salt_bytes = B64
        .decode(&file.salt)
        .map_err(|_| CoreError::Storage("vault corrupt: bad salt".into()))?;
    let salt: [u8; 16] = salt_bytes
        .try_into()
        .map_err(|_| CoreError::Storage("vault corrupt: bad salt length".into()))?;
    let nonce_bytes = B64
        .decode(&file.nonce)
        .map_err(|_| CoreError::Storage("vault corrupt: bad nonce".into()))?;
    let ciphertext = B64
        .decode(&file.ciphertext)
        .map_err(|_| CoreError::Storage("vault corrupt: bad ciphertext".into()))?;

    let key = crate::crypto::argon2id_derive(password.as_bytes(), &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|_| CoreError::Crypto("bad vault key length".into()))?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext.as_slice())
        .map_err(|_| CoreError::Auth)?;

    let keys: VaultKeys = serde_json::from_slice(&plaintext)
        .map_err(|e| CoreError::Storage(format!("vault payload corrupt: {e}")))?;
    Ok(keys.into_manager())
}

/// Securely remove a vault file: overwrite its contents with zeros
/// before unlinking, so an attacker who recovers the unlinked blocks
/// doesn't get the ciphertext. A missing file is not an error.
pub fn clear(path: &Path) -> Result<()> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CoreError::Storage(format!("vault stat failed: {e}"))),
    };
    fs::write(path, vec![0u8; len as usize]).map_err(|e| CoreError::Storage(format!("vault overwrite failed: {e}")))?;
    fs::remove_file(path).map_err(|e| CoreError::Storage(format!("vault unlink failed: {e}")))
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)
        .map_err(|e| CoreError::Storage(format!("vault write failed: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))
            .map_err(|e| CoreError::Storage(format!("vault chmod failed: {e}")))?;
    }

    fs::rename(&tmp_path, path).map_err(|e| CoreError::Storage(format!("vault rename failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_path::temp_path;

    mod tempfile_path {
        use std::path::PathBuf;

        pub fn temp_path(name: &str) -> PathBuf {
            let mut p = std::env::temp_dir();
            p.push(format!("wac-core-test-{}-{}", std::process::id(), name));
            p
        }
    }

    #[test]
    fn vault_round_trip_same_password() {
        let path = temp_path("roundtrip-ok");
        let mgr = KeyManager::generate(3);
        let fp = mgr.fingerprint();
        save(&path, "correct horse", &mgr).unwrap();

        let loaded = load(&path, "correct horse").unwrap();
        assert_eq!(loaded.fingerprint(), fp);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn vault_wrong_password_is_auth_error() {
        let path = temp_path("roundtrip-wrong");
        let mgr = KeyManager::generate(2);
        save(&path, "correct horse", &mgr).unwrap();

        let err = load(&path, "incorrect horse").unwrap_err();
        assert!(matches!(err, CoreError::Auth));

        // Vault untouched: the right password still works afterward.
        let loaded = load(&path, "correct horse").unwrap();
        assert_eq!(loaded.fingerprint(), mgr.fingerprint());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn clear_overwrites_then_unlinks() {
        let path = temp_path("clear");
        let mgr = KeyManager::generate(2);
        save(&path, "pw", &mgr).unwrap();
        assert!(path.exists());

        clear(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn clear_on_missing_file_is_not_an_error() {
        let path = temp_path("clear-missing");
        let _ = fs::remove_file(&path);
        clear(&path).unwrap();
    }

    #[test]
    fn vault_preserves_prekey_material() {
        let path = temp_path("prekeys");
        let mgr = KeyManager::generate(5);
        let bundle_before = mgr.public_bundle();
        save(&path, "pw", &mgr).unwrap();
        let loaded = load(&path, "pw").unwrap();
        let bundle_after = loaded.public_bundle();
        assert_eq!(bundle_before.signed_prekey.public_key, bundle_after.signed_prekey.public_key);
        assert_eq!(loaded.available_one_time_count(), 5);
        let _ = fs::remove_file(&path);
    }
}
