//! Extended Triple Diffie-Hellman (X3DH) key agreement.
//!
//! Establishes a shared secret between two parties for initializing a
//! Double Ratchet session. The responder publishes a prekey bundle; the
//! initiator uses it to derive a shared secret and send an initial
//! message without the responder being online.
//!
//! Reference: <https://signal.org/docs/specifications/x3dh/>
//!
//! KDF constants are wire-normative and MUST match bit-exact across
//! implementations: `salt = "WhatsAppCloneX3DH"`, `info = "SharedSecret"`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use ed25519_dalek::VerifyingKey;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::{self, SharedSecret};
use crate::error::{CoreError, Result};
use crate::keys::{KeyManager, PrekeyBundle};

const X3DH_SALT: &[u8] = b"WhatsAppCloneX3DH";
const X3DH_INFO: &[u8] = b"SharedSecret";

/// What the initiator derives, plus the bootstrap fields needed to build
/// the `x3dh` block of the first wire envelope.
pub struct InitiatorOutput {
    pub shared_secret: SharedSecret,
    pub our_identity_public: PublicKey,
    pub our_ephemeral_public: PublicKey,
    pub their_ratchet_key: PublicKey,
    pub used_signed_prekey_id: u32,
    pub used_one_time_prekey_id: Option<u32>,
}

fn decode_public(b64: &str) -> Result<PublicKey> {
    let bytes = B64
        .decode(b64)
        .map_err(|_| CoreError::Protocol("invalid base64 public key".into()))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CoreError::Protocol("public key must be 32 bytes".into()))?;
    Ok(PublicKey::from(arr))
}

fn decode_verifying(b64: &str) -> Result<VerifyingKey> {
    let bytes = B64
        .decode(b64)
        .map_err(|_| CoreError::Protocol("invalid base64 signing key".into()))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CoreError::Protocol("signing key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&arr).map_err(|_| CoreError::Crypto("invalid signing key".into()))
}

/// Initiator half of X3DH. `our_identity_secret` is our long-term X25519
/// identity private key; `their_bundle` is the peer's fetched public
/// bundle. Verifies the signed prekey's signature before doing any DH
/// work — failure is fatal and derives nothing.
pub fn initiate(our_identity_secret: &StaticSecret, their_bundle: &PrekeyBundle) -> Result<InitiatorOutput> {
    let their_identity = decode_public(&their_bundle.identity_key)?;
    let their_signing = decode_verifying(&their_bundle.signing_key)?;
    let their_spk = decode_public(&their_bundle.signed_prekey.public_key)?;
    let signature = B64
        .decode(&their_bundle.signed_prekey.signature)
        .map_err(|_| CoreError::Protocol("invalid base64 signature".into()))?;

    crypto::ed25519_verify(&their_signing, their_spk.as_bytes(), &signature)?;

    let their_otk = their_bundle
        .one_time_prekey
        .as_ref()
        .map(|otk| decode_public(&otk.public_key).map(|pk| (otk.key_id, pk)))
        .transpose()?;

    let (ek_secret, ek_public) = crypto::x25519_generate();

    let dh1 = crypto::x25519_dh(our_identity_secret, &their_spk);
    let dh2 = crypto::x25519_dh(&ek_secret, &their_identity);
    let dh3 = crypto::x25519_dh(&ek_secret, &their_spk);

    let mut ikm = Vec::with_capacity(128);
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    ikm.extend_from_slice(&dh3);
    if let Some((_, otk_pub)) = &their_otk {
        let dh4 = crypto::x25519_dh(&ek_secret, otk_pub);
        ikm.extend_from_slice(&dh4);
    }

    let mut ss = [0u8; 32];
    crypto::hkdf_sha256(&ikm, X3DH_SALT, X3DH_INFO, &mut ss)?;

    Ok(InitiatorOutput {
        shared_secret: SharedSecret(ss),
        our_identity_public: PublicKey::from(our_identity_secret),
        our_ephemeral_public: ek_public,
        their_ratchet_key: their_spk,
        used_signed_prekey_id: their_bundle.signed_prekey.key_id,
        used_one_time_prekey_id: their_otk.map(|(id, _)| id),
    })
}

/// Responder half of X3DH. Looks up our signed-prekey (and, if named,
/// one-time-prekey) private halves by id. Does **not** consume the
/// one-time prekey from the pool — the caller (session manager) must do
/// that atomically with installing the ratchet, so a crash between the
/// two never leaves a one-time prekey consumed without a session to
/// show for it.
pub fn respond(
    key_manager: &KeyManager,
    their_identity_public: &PublicKey,
    their_ephemeral_public: &PublicKey,
    used_signed_prekey_id: u32,
    used_one_time_prekey_id: Option<u32>,
) -> Result<SharedSecret> {
    let spk_secret = key_manager.signed_prekey_private(used_signed_prekey_id)?;
    let opk_secret = used_one_time_prekey_id
        .map(|id| key_manager.one_time_prekey_private(id))
        .transpose()?;

    let dh1 = crypto::x25519_dh(spk_secret, their_identity_public);
    let dh2 = crypto::x25519_dh(key_manager.identity_secret(), their_ephemeral_public);
    let dh3 = crypto::x25519_dh(spk_secret, their_ephemeral_public);

    let mut ikm = Vec::with_capacity(128);
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    ikm.extend_from_slice(&dh3);
    if let Some(opk_secret) = opk_secret {
        let dh4 = crypto::x25519_dh(opk_secret, their_ephemeral_public);
        ikm.extend_from_slice(&dh4);
    }

    let mut ss = [0u8; 32];
    crypto::hkdf_sha256(&ikm, X3DH_SALT, X3DH_INFO, &mut ss)?;
    Ok(SharedSecret(ss))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyManager;

    #[test]
    fn full_x3dh_handshake_with_otk() {
        let bob = KeyManager::generate(3);
        let bob_bundle = bob.public_bundle();
        assert!(bob_bundle.one_time_prekey.is_some());

        let alice = KeyManager::generate(1);
        let out = initiate(alice.identity_secret(), &bob_bundle).unwrap();
        assert_eq!(out.used_signed_prekey_id, 1);
        assert!(out.used_one_time_prekey_id.is_some());

        let shared = respond(
            &bob,
            &out.our_identity_public,
            &out.our_ephemeral_public,
            out.used_signed_prekey_id,
            out.used_one_time_prekey_id,
        )
        .unwrap();

        assert_eq!(shared.as_bytes(), out.shared_secret.as_bytes());
    }

    #[test]
    fn handshake_without_otk_available() {
        let mut bob = KeyManager::generate(1);
        let id = bob.public_bundle().one_time_prekey.unwrap().key_id;
        bob.consume_one_time(id);
        let bob_bundle = bob.public_bundle();
        assert!(bob_bundle.one_time_prekey.is_none());

        let alice = KeyManager::generate(1);
        let out = initiate(alice.identity_secret(), &bob_bundle).unwrap();
        assert!(out.used_one_time_prekey_id.is_none());

        let shared = respond(
            &bob,
            &out.our_identity_public,
            &out.our_ephemeral_public,
            out.used_signed_prekey_id,
            None,
        )
        .unwrap();
        assert_eq!(shared.as_bytes(), out.shared_secret.as_bytes());
    }

    #[test]
    fn tampered_signature_rejected() {
        let bob = KeyManager::generate(1);
        let mut bundle = bob.public_bundle();
        // Flip a byte of the signature.
        let mut sig = B64.decode(&bundle.signed_prekey.signature).unwrap();
        sig[0] ^= 0xFF;
        bundle.signed_prekey.signature = B64.encode(sig);

        let alice = KeyManager::generate(1);
        assert!(initiate(alice.identity_secret(), &bundle).is_err());
    }

    #[test]
    fn missing_prekey_is_state_missing() {
        let alice = KeyManager::generate(0);
        let bob = KeyManager::generate(0);
        let bundle = bob.public_bundle();
        let out = initiate(alice.identity_secret(), &bundle).unwrap();

        let err = respond(
            &bob,
            &out.our_identity_public,
            &out.our_ephemeral_public,
            999, // wrong signed prekey id
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::StateMissing(_)));
    }
}
