//! Session orchestration: at-most-one ratchet session per peer,
//! X3DH bootstrap on the first outbound message, and peer-reset
//! detection when a peer's ratchet key resets unexpectedly.
//!
//! Sessions are installed then persisted immediately; X3DH bootstrap
//! data is carried only on the first envelope sent after a fresh
//! initiator session is installed.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::keys::KeyManager;
use crate::ratchet::Ratchet;
use crate::transport::{Envelope, EnvelopeHeader, PrekeyDirectory, X3dhBootstrap};
use crate::x3dh;

/// Inbound message number below which a peer is presumed to have reset
/// its ratchet state.
const PEER_RESET_THRESHOLD: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum Role {
    Initiator,
    Responder,
}

/// The X3DH fields carried on the first outbound envelope of a session we
/// initiated. Cleared the moment that envelope is built — every
/// subsequent send for this session carries no `x3dh` block.
#[derive(Clone, Serialize, Deserialize)]
struct PendingBootstrap {
    sender_identity_key: [u8; 32],
    sender_ephemeral_key: [u8; 32],
    used_signed_prekey_id: u32,
    used_one_time_prekey_id: Option<u32>,
}

#[derive(Clone, Serialize, Deserialize)]
struct SessionEntry {
    role: Role,
    ratchet: Ratchet,
    bootstrap_pending: Option<PendingBootstrap>,
}

/// Owns the local key manager and every active per-peer ratchet session.
/// Each peer has at most one session at a time: establishing a new one
/// (via `ensure_session`, or responder bootstrap during `decrypt`)
/// replaces whatever was there before.
pub struct SessionManager {
    key_manager: KeyManager,
    sessions: HashMap<String, SessionEntry>,
    sessions_dir: PathBuf,
}

impl SessionManager {
    pub fn new(key_manager: KeyManager, storage_dir: &Path) -> Result<Self> {
        let sessions_dir = storage_dir.join("sessions");
        fs::create_dir_all(&sessions_dir).map_err(|e| CoreError::Storage(format!("sessions dir: {e}")))?;
        Ok(Self { key_manager, sessions: HashMap::new(), sessions_dir })
    }

    pub fn key_manager(&self) -> &KeyManager {
        &self.key_manager
    }

    pub fn key_manager_mut(&mut self) -> &mut KeyManager {
        &mut self.key_manager
    }

    pub fn has_session(&self, peer_id: &str) -> bool {
        self.sessions.contains_key(peer_id)
    }

    /// Establish a session as initiator if none exists yet. A no-op if a
    /// session with this peer is already active — callers that want to
    /// force re-establishment should call `reset_session` first.
    pub fn ensure_session(&mut self, peer_id: &str, directory: &dyn PrekeyDirectory) -> Result<()> {
        if self.sessions.contains_key(peer_id) {
            debug!(peer_id, "session already established");
            return Ok(());
        }

        info!(peer_id, "establishing session as initiator");
        let bundle = directory.fetch_bundle(peer_id)?;
        let out = x3dh::initiate(self.key_manager.identity_secret(), &bundle)?;

        let ratchet = Ratchet::init_initiator(&out.shared_secret)?;
        let entry = SessionEntry {
            role: Role::Initiator,
            ratchet,
            bootstrap_pending: Some(PendingBootstrap {
                sender_identity_key: out.our_identity_public.to_bytes(),
                sender_ephemeral_key: out.our_ephemeral_public.to_bytes(),
                used_signed_prekey_id: out.used_signed_prekey_id,
                used_one_time_prekey_id: out.used_one_time_prekey_id,
            }),
        };
        self.sessions.insert(peer_id.to_string(), entry);
        self.persist(peer_id)?;
        Ok(())
    }

    /// Encrypt a plaintext for `peer_id`. Requires a session to already
    /// exist (call `ensure_session` first). Attaches the `x3dh` bootstrap
    /// block exactly once — on the first envelope sent after
    /// `ensure_session` installs a fresh initiator session.
    pub fn encrypt(&mut self, peer_id: &str, plaintext: &[u8]) -> Result<Envelope> {
        let entry = self
            .sessions
            .get_mut(peer_id)
            .ok_or_else(|| CoreError::StateMissing(format!("no session with {peer_id}")))?;

        let (ciphertext, header) = entry.ratchet.encrypt(plaintext)?;
        let x3dh_block = entry.bootstrap_pending.take().map(|pending| X3dhBootstrap {
            sender_identity_key: B64.encode(pending.sender_identity_key),
            sender_ephemeral_key: B64.encode(pending.sender_ephemeral_key),
            used_signed_prekey_id: pending.used_signed_prekey_id,
            used_one_time_prekey_id: pending.used_one_time_prekey_id,
        });

        let envelope = Envelope {
            ciphertext,
            header: EnvelopeHeader::from_header(&header),
            x3dh: x3dh_block,
        };
        self.persist(peer_id)?;
        Ok(envelope)
    }

    /// Decrypt an inbound envelope from `peer_id`, establishing a
    /// responder session first if the envelope carries X3DH bootstrap
    /// data and none exists yet. Detects an unexpected peer ratchet
    /// reset and fails the message rather than silently reinitializing.
    pub fn decrypt(&mut self, peer_id: &str, envelope: &Envelope, directory: &dyn PrekeyDirectory) -> Result<Vec<u8>> {
        if !self.sessions.contains_key(peer_id) {
            let Some(bootstrap) = &envelope.x3dh else {
                return Err(CoreError::StateMissing(format!("no session with {peer_id} and no X3DH data to bootstrap one")));
            };
            self.establish_responder(peer_id, bootstrap, &envelope.header, directory)?;
        } else if self.looks_like_peer_reset(peer_id, envelope) {
            warn!(peer_id, "peer ratchet reset detected, dropping session");
            self.sessions.remove(peer_id);
            self.remove_persisted(peer_id);
            return Err(CoreError::PeerReset);
        }

        let entry = self
            .sessions
            .get_mut(peer_id)
            .ok_or_else(|| CoreError::StateMissing(format!("no session with {peer_id}")))?;
        let header = envelope.header.to_header()?;
        let plaintext = entry.ratchet.decrypt(&envelope.ciphertext, &header)?;
        self.persist(peer_id)?;
        Ok(plaintext)
    }

    fn looks_like_peer_reset(&self, peer_id: &str, envelope: &Envelope) -> bool {
        let Some(entry) = self.sessions.get(peer_id) else { return false };
        let inbound_low = envelope.header.message_number < PEER_RESET_THRESHOLD;
        let we_are_established =
            entry.ratchet.recv_counter() >= PEER_RESET_THRESHOLD || entry.ratchet.send_counter() >= PEER_RESET_THRESHOLD;
        inbound_low && we_are_established
    }

    fn establish_responder(
        &mut self,
        peer_id: &str,
        bootstrap: &X3dhBootstrap,
        header: &EnvelopeHeader,
        directory: &dyn PrekeyDirectory,
    ) -> Result<()> {
        info!(peer_id, "establishing session as responder");
        let their_identity = crate::transport::decode_public(&bootstrap.sender_identity_key)?;
        let their_ephemeral = crate::transport::decode_public(&bootstrap.sender_ephemeral_key)?;

        let shared_secret = x3dh::respond(
            &self.key_manager,
            &their_identity,
            &their_ephemeral,
            bootstrap.used_signed_prekey_id,
            bootstrap.used_one_time_prekey_id,
        )?;

        if let Some(otk_id) = bootstrap.used_one_time_prekey_id {
            self.key_manager.consume_one_time(otk_id);
            if let Err(e) = directory.mark_one_time_prekey_used(peer_id, otk_id) {
                warn!(peer_id, otk_id, error = %e, "failed to notify directory of consumed one-time prekey");
            }
        }

        let sender_ratchet_key = header.to_header()?.ratchet_key;
        let ratchet = Ratchet::init_responder(&shared_secret, sender_ratchet_key)?;
        self.sessions.insert(
            peer_id.to_string(),
            SessionEntry { role: Role::Responder, ratchet, bootstrap_pending: None },
        );
        Ok(())
    }

    /// Drop a session, e.g. at the user's request or after a detected
    /// peer reset has already been surfaced to the caller.
    pub fn reset_session(&mut self, peer_id: &str) {
        self.sessions.remove(peer_id);
        self.remove_persisted(peer_id);
    }

    fn session_path(&self, peer_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{peer_id}.json"))
    }

    /// Write-to-temp-then-rename, matching the vault's durability
    /// convention. Session files hold ratchet secrets but, unlike the
    /// vault, are not password-encrypted — encryption-at-rest is scoped
    /// to long-term identity material only.
    fn persist(&self, peer_id: &str) -> Result<()> {
        let entry = match self.sessions.get(peer_id) {
            Some(e) => e,
            None => return Ok(()),
        };
        let json = serde_json::to_vec(entry).map_err(|e| CoreError::Storage(format!("session serialize failed: {e}")))?;
        let path = self.session_path(peer_id);
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, &json).map_err(|e| CoreError::Storage(format!("session write failed: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))
                .map_err(|e| CoreError::Storage(format!("session chmod failed: {e}")))?;
        }

        fs::rename(&tmp_path, &path).map_err(|e| CoreError::Storage(format!("session rename failed: {e}")))
    }

    fn remove_persisted(&self, peer_id: &str) {
        let _ = fs::remove_file(self.session_path(peer_id));
    }

    /// Load a previously persisted session back into memory, e.g. at
    /// process startup. A missing file is not an error — it just means
    /// no session exists yet.
    pub fn load_session(&mut self, peer_id: &str) -> Result<()> {
        let path = self.session_path(peer_id);
        if !path.exists() {
            return Ok(());
        }
        let raw = fs::read(&path).map_err(|e| CoreError::Storage(format!("session read failed: {e}")))?;
        let entry: SessionEntry =
            serde_json::from_slice(&raw).map_err(|e| CoreError::Storage(format!("session corrupt: {e}")))?;
        self.sessions.insert(peer_id.to_string(), entry);
        Ok(())
    }
}
