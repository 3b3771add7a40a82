//! Cryptographic primitives.
//!
//! Thin, spec-exact wrappers around audited crates: X25519 and Ed25519 via
//! `x25519-dalek`/`ed25519-dalek`, HKDF-SHA256 and HMAC-SHA256 via
//! `hkdf`/`hmac`, XSalsa20-Poly1305 AEAD via `xsalsa20poly1305`, and
//! Argon2id via `argon2`. Nothing here decides protocol behavior — that's
//! `x3dh.rs` and `ratchet.rs`.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use xsalsa20poly1305::aead::{Aead, KeyInit, Payload};
use xsalsa20poly1305::{Nonce, XSalsa20Poly1305};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CoreError;

/// Length of the XSalsa20-Poly1305 nonce.
pub const AEAD_NONCE_LEN: usize = 24;
/// Length of the Poly1305 authentication tag appended by the AEAD.
const AEAD_TAG_LEN: usize = 16;

/// A 32-byte secret that is wiped from memory on drop.
///
/// Used for X3DH-derived shared secrets and vault keys: both are
/// transient and should be zeroized as soon as they've been consumed
/// (ratchet install, or vault encrypt/decrypt).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(pub [u8; 32]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// X25519 Diffie-Hellman.
pub fn x25519_dh(secret: &StaticSecret, public: &PublicKey) -> [u8; 32] {
    secret.diffie_hellman(public).to_bytes()
}

/// Generate a fresh X25519 keypair using the system CSRNG.
pub fn x25519_generate() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Ed25519 signature over `msg` using `signing_key`.
pub fn ed25519_sign(signing_key: &SigningKey, msg: &[u8]) -> [u8; 64] {
    signing_key.sign(msg).to_bytes()
}

/// Ed25519 signature verification.
pub fn ed25519_verify(
    verifying_key: &VerifyingKey,
    msg: &[u8],
    signature: &[u8],
) -> Result<(), CoreError> {
    let sig = Signature::from_slice(signature)
        .map_err(|_| CoreError::Crypto("malformed signature".into()))?;
    verifying_key
        .verify(msg, &sig)
        .map_err(|_| CoreError::Crypto("signature verification failed".into()))
}

/// `HKDF-SHA256(ikm, salt, info, L)`, writing `L = out.len()` bytes into `out`.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) -> Result<(), CoreError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    hk.expand(info, out)
        .map_err(|_| CoreError::Crypto("HKDF expand failed".into()))
}

/// `HMAC-SHA256(key, data) -> 32 B`.
pub fn hmac_sha256(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// XSalsa20-Poly1305 AEAD encrypt. Returns the combined wire form
/// `nonce ‖ ciphertext ‖ tag`, using `aad` as associated data.
pub fn aead_encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CoreError> {
    let cipher = XSalsa20Poly1305::new(key.into());
    let mut nonce_bytes = [0u8; AEAD_NONCE_LEN];
    rand::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ct = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CoreError::Crypto("AEAD encrypt failed".into()))?;
    let mut out = Vec::with_capacity(AEAD_NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// XSalsa20-Poly1305 AEAD decrypt of the combined `nonce ‖ ciphertext ‖ tag` form.
pub fn aead_decrypt(key: &[u8; 32], combined: &[u8], aad: &[u8]) -> Result<Vec<u8>, CoreError> {
    if combined.len() < AEAD_NONCE_LEN + AEAD_TAG_LEN {
        return Err(CoreError::Crypto("ciphertext too short".into()));
    }
    let (nonce_bytes, ct) = combined.split_at(AEAD_NONCE_LEN);
    let cipher = XSalsa20Poly1305::new(key.into());
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, Payload { msg: ct, aad })
        .map_err(|_| CoreError::Crypto("decryption failed".into()))
}

/// `Argon2id(password, salt, m=64 MiB, t=3, p=4, L=32)`.
pub fn argon2id_derive(password: &[u8], salt: &[u8; 16]) -> Result<[u8; 32], CoreError> {
    use argon2::{Algorithm, Argon2, Params, Version};

    let params = Params::new(64 * 1024, 3, 4, Some(32))
        .map_err(|e| CoreError::Crypto(format!("invalid Argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; 32];
    argon2
        .hash_password_into(password, salt, &mut out)
        .map_err(|e| CoreError::Crypto(format!("Argon2id derivation failed: {e}")))?;
    Ok(out)
}

/// Random salt/nonce generation via the system CSRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::RngCore::fill_bytes(&mut OsRng, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_agreement_symmetric() {
        let (a_sec, a_pub) = x25519_generate();
        let (b_sec, b_pub) = x25519_generate();
        assert_eq!(x25519_dh(&a_sec, &b_pub), x25519_dh(&b_sec, &a_pub));
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let sk = SigningKey::generate(&mut OsRng);
        let vk = sk.verifying_key();
        let sig = ed25519_sign(&sk, b"message");
        ed25519_verify(&vk, b"message", &sig).unwrap();
    }

    #[test]
    fn wrong_message_rejected() {
        let sk = SigningKey::generate(&mut OsRng);
        let vk = sk.verifying_key();
        let sig = ed25519_sign(&sk, b"message");
        assert!(ed25519_verify(&vk, b"tampered", &sig).is_err());
    }

    #[test]
    fn hkdf_is_deterministic() {
        let mut out1 = [0u8; 32];
        let mut out2 = [0u8; 32];
        hkdf_sha256(b"ikm", b"salt", b"info", &mut out1).unwrap();
        hkdf_sha256(b"ikm", b"salt", b"info", &mut out2).unwrap();
        assert_eq!(out1, out2);
    }

    #[test]
    fn aead_roundtrip() {
        let key = [7u8; 32];
        let ct = aead_encrypt(&key, b"hello", b"aad").unwrap();
        let pt = aead_decrypt(&key, &ct, b"aad").unwrap();
        assert_eq!(pt, b"hello");
    }

    #[test]
    fn aead_tampered_aad_rejected() {
        let key = [7u8; 32];
        let ct = aead_encrypt(&key, b"hello", b"aad").unwrap();
        assert!(aead_decrypt(&key, &ct, b"different").is_err());
    }

    #[test]
    fn argon2id_deterministic_for_same_salt() {
        let salt = [3u8; 16];
        let k1 = argon2id_derive(b"correct horse", &salt).unwrap();
        let k2 = argon2id_derive(b"correct horse", &salt).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn argon2id_differs_for_wrong_password() {
        let salt = [3u8; 16];
        let k1 = argon2id_derive(b"correct horse", &salt).unwrap();
        let k2 = argon2id_derive(b"wrong password", &salt).unwrap();
        assert_ne!(k1, k2);
    }
}
