//! Wire envelope and directory/transport seams.
//!
//! The envelope shape is bit-exact: standard (padded) base64 throughout,
//! camelCase field names, and an optional `x3dh` block
//! carried only on the first message of a session. A legacy
//! `"E2EE:" + json` wrapped form is also accepted on decode for
//! interop with senders that still prefix it.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey;

use crate::error::{CoreError, Result};
use crate::keys::PrekeyBundle;
use crate::ratchet::Header;

const LEGACY_PREFIX: &str = "E2EE:";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    #[serde(rename = "ratchetKey")]
    pub ratchet_key: String,
    #[serde(rename = "previousChainLength")]
    pub previous_chain_length: u32,
    #[serde(rename = "messageNumber")]
    pub message_number: u32,
}

impl EnvelopeHeader {
    pub fn from_header(header: &Header) -> Self {
        Self {
            ratchet_key: B64.encode(header.ratchet_key),
            previous_chain_length: header.previous_chain_length,
            message_number: header.message_number,
        }
    }

    pub fn to_header(&self) -> Result<Header> {
        let bytes = B64
            .decode(&self.ratchet_key)
            .map_err(|_| CoreError::Protocol("invalid base64 ratchet key".into()))?;
        let ratchet_key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::Protocol("ratchet key must be 32 bytes".into()))?;
        Ok(Header {
            ratchet_key,
            previous_chain_length: self.previous_chain_length,
            message_number: self.message_number,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct X3dhBootstrap {
    #[serde(rename = "senderIdentityKey")]
    pub sender_identity_key: String,
    #[serde(rename = "senderEphemeralKey")]
    pub sender_ephemeral_key: String,
    #[serde(rename = "usedSignedPrekeyId")]
    pub used_signed_prekey_id: u32,
    #[serde(rename = "usedOneTimePrekeyId", skip_serializing_if = "Option::is_none")]
    pub used_one_time_prekey_id: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub ciphertext: String,
    pub header: EnvelopeHeader,
    #[serde(rename = "x3dh", skip_serializing_if = "Option::is_none")]
    pub x3dh: Option<X3dhBootstrap>,
}

impl Envelope {
    /// Serialize to the wire form. Never emits the legacy `"E2EE:"` prefix
    /// — that form is accepted on decode only, for senders still using it.
    pub fn to_wire(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| CoreError::Protocol(format!("envelope serialize failed: {e}")))
    }

    pub fn from_wire(wire: &str) -> Result<Self> {
        let json = wire.strip_prefix(LEGACY_PREFIX).unwrap_or(wire);
        serde_json::from_str(json).map_err(|e| CoreError::Protocol(format!("envelope parse failed: {e}")))
    }
}

/// Fetches a peer's published prekey bundle. Implemented by whatever
/// transport layer sits above this crate (HTTP client, in-memory test
/// double, and so on) — this crate only defines the seam.
pub trait PrekeyDirectory: Send + Sync {
    fn fetch_bundle(&self, peer_id: &str) -> Result<PrekeyBundle>;
    fn publish_bundle(&self, bundle: &PrekeyBundle) -> Result<()>;
    fn mark_one_time_prekey_used(&self, peer_id: &str, key_id: u32) -> Result<()>;
}

/// Delivers an envelope to a peer. Implemented by the surrounding
/// application; this crate never performs network I/O itself.
pub trait EnvelopeTransport: Send + Sync {
    fn send(&self, peer_id: &str, envelope: &Envelope) -> Result<()>;
}

pub(crate) fn decode_public(b64: &str) -> Result<PublicKey> {
    let bytes = B64
        .decode(b64)
        .map_err(|_| CoreError::Protocol("invalid base64 public key".into()))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CoreError::Protocol("public key must be 32 bytes".into()))?;
    Ok(PublicKey::from(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_wire_form() {
        let env = Envelope {
            ciphertext: "Y2lwaGVy".to_string(),
            header: EnvelopeHeader {
                ratchet_key: B64.encode([1u8; 32]),
                previous_chain_length: 0,
                message_number: 3,
            },
            x3dh: None,
        };
        let wire = env.to_wire().unwrap();
        let back = Envelope::from_wire(&wire).unwrap();
        assert_eq!(back.header.message_number, 3);
    }

    #[test]
    fn legacy_prefix_is_accepted_on_decode() {
        let env = Envelope {
            ciphertext: "Y2lwaGVy".to_string(),
            header: EnvelopeHeader {
                ratchet_key: B64.encode([2u8; 32]),
                previous_chain_length: 0,
                message_number: 0,
            },
            x3dh: None,
        };
        let wire = format!("{LEGACY_PREFIX}{}", env.to_wire().unwrap());
        let back = Envelope::from_wire(&wire).unwrap();
        assert_eq!(back.header.ratchet_key, env.header.ratchet_key);
    }

    #[test]
    fn x3dh_block_omitted_when_none() {
        let env = Envelope {
            ciphertext: "abc".to_string(),
            header: EnvelopeHeader {
                ratchet_key: B64.encode([0u8; 32]),
                previous_chain_length: 0,
                message_number: 0,
            },
            x3dh: None,
        };
        let wire = env.to_wire().unwrap();
        assert!(!wire.contains("x3dh"));
    }
}
