//! E2EE session core: X3DH key agreement and Double Ratchet messaging for
//! a Signal-style client, plus the key-material lifecycle both depend on.
//!
//! Module map (see DESIGN.md for the full grounding ledger):
//! - [`crypto`] — primitive wrappers
//! - [`keys`], [`vault`] — identity/prekey lifecycle and encrypted-at-rest
//!   storage
//! - [`x3dh`] — session-establishment key agreement
//! - [`ratchet`] — Double Ratchet message encryption
//! - [`session`] — per-peer session orchestration
//! - [`transport`] — wire envelope and directory/transport seams

pub mod config;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod ratchet;
pub mod session;
#[cfg(feature = "telemetry")]
pub mod telemetry;
pub mod transport;
pub mod vault;
pub mod x3dh;

pub use config::KeyManagerConfig;
pub use error::{CoreError, Result};
pub use keys::KeyManager;
pub use session::SessionManager;
pub use transport::{Envelope, EnvelopeTransport, PrekeyDirectory};
