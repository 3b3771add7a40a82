//! Key manager.
//!
//! Owns all long-term private key material: the X25519 identity keypair,
//! the Ed25519 signing keypair, the current signed prekey, and the
//! one-time prekey pool. Private halves are released only by borrow to
//! the X3DH engine; nothing outside this module ever clones a secret key
//! onto the heap longer than it has to.

use std::collections::BTreeMap;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::config::KeyManagerConfig;
use crate::crypto;
use crate::error::{CoreError, Result};
use crate::vault;

/// Default one-time prekey pool size.
pub const DEFAULT_OTK_POOL_SIZE: u32 = 100;
/// Refill threshold.
pub const DEFAULT_OTK_REFILL_THRESHOLD: u32 = 20;

/// An X25519 signed prekey: a medium-term DH keypair plus an Ed25519
/// signature over its public half, and a monotonic key-id.
#[derive(Clone)]
pub struct SignedPreKey {
    pub id: u32,
    pub secret: StaticSecret,
    pub public: PublicKey,
    pub signature: [u8; 64],
}

impl SignedPreKey {
    fn generate(id: u32, signing_key: &SigningKey) -> Self {
        let (secret, public) = crypto::x25519_generate();
        let signature = crypto::ed25519_sign(signing_key, public.as_bytes());
        Self { id, secret, public, signature }
    }
}

/// An X25519 one-time prekey: consumed at most once as responder.
#[derive(Clone)]
pub struct OneTimePreKey {
    pub id: u32,
    pub secret: StaticSecret,
    pub public: PublicKey,
}

/// The public prekey bundle published for other users to fetch before
/// initiating X3DH. Field names and base64 encoding (standard, with
/// padding) are bit-exact to the wire contract other clients expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyBundle {
    #[serde(rename = "identityKey")]
    pub identity_key: String,
    #[serde(rename = "signingKey")]
    pub signing_key: String,
    pub fingerprint: String,
    #[serde(rename = "signedPrekey")]
    pub signed_prekey: SignedPrekeyPublic,
    #[serde(rename = "oneTimePrekey", skip_serializing_if = "Option::is_none")]
    pub one_time_prekey: Option<OneTimePrekeyPublic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPrekeyPublic {
    #[serde(rename = "keyId")]
    pub key_id: u32,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePrekeyPublic {
    #[serde(rename = "keyId")]
    pub key_id: u32,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// Deterministic fingerprint of an identity public key: SHA-256 over the
/// 32-byte key, truncated to 30 bytes, rendered as 60 lowercase hex
/// characters. Equal fingerprints imply equal identity keys.
pub fn fingerprint(identity_public: &PublicKey) -> String {
    let digest = Sha256::digest(identity_public.as_bytes());
    digest[..30].iter().map(|b| format!("{b:02x}")).collect()
}

/// Long-term cryptographic identity and prekey material for one local user.
pub struct KeyManager {
    identity_secret: StaticSecret,
    identity_public: PublicKey,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    signed_prekey: SignedPreKey,
    one_time_prekeys: BTreeMap<u32, OneTimePreKey>,
    next_otk_id: u32,
}

impl KeyManager {
    /// Generate a brand-new identity: fresh identity/signing keys, one
    /// signed prekey (key-id 1), and a full one-time prekey pool.
    pub fn generate(otk_pool_size: u32) -> Self {
        let (identity_secret, identity_public) = crypto::x25519_generate();
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let signed_prekey = SignedPreKey::generate(1, &signing_key);

        let mut mgr = Self {
            identity_secret,
            identity_public,
            signing_key,
            verifying_key,
            signed_prekey,
            one_time_prekeys: BTreeMap::new(),
            next_otk_id: 1,
        };
        mgr.rotate_one_time(otk_pool_size);
        mgr
    }

    /// Load-or-generate: if `user_id`'s vault exists and `password`
    /// decrypts it, load all key material from it; otherwise generate a
    /// fresh identity (and, if a password was given, write it to a new
    /// vault). With no password, never touches the vault file at all —
    /// the returned identity is in-memory only.
    ///
    /// A wrong password surfaces as `CoreError::Auth` rather than
    /// silently regenerating a new identity over the existing vault.
    pub fn initialize(config: &KeyManagerConfig, user_id: &str, password: Option<&str>) -> Result<Self> {
        let path = config.vault_path(user_id);
        match password {
            Some(password) => {
                if Path::new(&path).exists() {
                    vault::load(&path, password)
                } else {
                    let mgr = Self::generate(config.one_time_pool_size);
                    vault::save(&path, password, &mgr)?;
                    Ok(mgr)
                }
            }
            None => Ok(Self::generate(config.one_time_pool_size)),
        }
    }

    /// Reconstruct from material loaded out of the encrypted vault.
    pub(crate) fn from_parts(
        identity_secret: StaticSecret,
        signing_key: SigningKey,
        signed_prekey: SignedPreKey,
        one_time_prekeys: BTreeMap<u32, OneTimePreKey>,
        next_otk_id: u32,
    ) -> Self {
        let identity_public = PublicKey::from(&identity_secret);
        let verifying_key = signing_key.verifying_key();
        Self {
            identity_secret,
            identity_public,
            signing_key,
            verifying_key,
            signed_prekey,
            one_time_prekeys,
            next_otk_id,
        }
    }

    pub fn identity_secret(&self) -> &StaticSecret {
        &self.identity_secret
    }

    pub fn identity_public(&self) -> &PublicKey {
        &self.identity_public
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    pub fn signed_prekey(&self) -> &SignedPreKey {
        &self.signed_prekey
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.identity_public)
    }

    /// Assemble the public bundle other users fetch before starting a
    /// session. Includes one one-time prekey (the server is expected to
    /// hand out and delete one-time prekeys one at a time; the core
    /// always offers its lowest unused id first).
    pub fn public_bundle(&self) -> PrekeyBundle {
        let one_time_prekey = self.one_time_prekeys.values().next().map(|otk| OneTimePrekeyPublic {
            key_id: otk.id,
            public_key: B64.encode(otk.public.as_bytes()),
        });
        PrekeyBundle {
            identity_key: B64.encode(self.identity_public.as_bytes()),
            signing_key: B64.encode(self.verifying_key.as_bytes()),
            fingerprint: self.fingerprint(),
            signed_prekey: SignedPrekeyPublic {
                key_id: self.signed_prekey.id,
                public_key: B64.encode(self.signed_prekey.public.as_bytes()),
                signature: B64.encode(self.signed_prekey.signature),
            },
            one_time_prekey,
        }
    }

    pub fn available_one_time_count(&self) -> usize {
        self.one_time_prekeys.len()
    }

    pub fn needs_refill(&self, threshold: u32) -> bool {
        (self.available_one_time_count() as u32) < threshold
    }

    /// Regenerate the one-time prekey pool. Ids keep counting up from the
    /// manager's lifetime counter rather than resetting to 1, so a used
    /// id from a prior generation can never collide with a freshly
    /// generated one (see DESIGN.md for why this departs from the
    /// source's per-batch `i + 1` numbering).
    pub fn rotate_one_time(&mut self, count: u32) {
        self.one_time_prekeys.clear();
        for _ in 0..count {
            let id = self.next_otk_id;
            self.next_otk_id += 1;
            let (secret, public) = crypto::x25519_generate();
            self.one_time_prekeys.insert(id, OneTimePreKey { id, secret, public });
        }
    }

    /// Remove a one-time prekey from the pool. Idempotent: removing an
    /// already-consumed id is not an error.
    pub fn consume_one_time(&mut self, key_id: u32) {
        self.one_time_prekeys.remove(&key_id);
    }

    /// Borrow the signed prekey's private half for responder X3DH, if the
    /// id still matches the active signed prekey.
    pub fn signed_prekey_private(&self, key_id: u32) -> Result<&StaticSecret> {
        if self.signed_prekey.id == key_id {
            Ok(&self.signed_prekey.secret)
        } else {
            Err(CoreError::StateMissing(format!("signed prekey {key_id} not found")))
        }
    }

    /// Borrow a one-time prekey's private half for responder X3DH.
    /// Returns `StateMissing` if it was already consumed or rotated out.
    pub fn one_time_prekey_private(&self, key_id: u32) -> Result<&StaticSecret> {
        self.one_time_prekeys
            .get(&key_id)
            .map(|otk| &otk.secret)
            .ok_or_else(|| CoreError::StateMissing(format!("one-time prekey {key_id} not found")))
    }

    pub(crate) fn one_time_prekeys(&self) -> &BTreeMap<u32, OneTimePreKey> {
        &self.one_time_prekeys
    }

    pub(crate) fn next_otk_id(&self) -> u32 {
        self.next_otk_id
    }
}
