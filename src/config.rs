//! Runtime configuration.

use std::path::PathBuf;

use crate::keys::{DEFAULT_OTK_POOL_SIZE, DEFAULT_OTK_REFILL_THRESHOLD};

/// Configuration for a `KeyManager` + `SessionManager` pair. A plain
/// struct with a `Default` impl rather than a builder, since every field
/// has a sane value and callers typically only override one or two.
#[derive(Debug, Clone)]
pub struct KeyManagerConfig {
    /// Directory holding the vault file and `sessions/` subdirectory.
    pub storage_dir: PathBuf,
    /// One-time prekeys generated on a fresh identity or full rotation.
    pub one_time_pool_size: u32,
    /// Refill the pool once available one-time prekeys drop below this.
    pub one_time_refill_threshold: u32,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        let storage_dir = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("wac-core");
        Self {
            storage_dir,
            one_time_pool_size: DEFAULT_OTK_POOL_SIZE,
            one_time_refill_threshold: DEFAULT_OTK_REFILL_THRESHOLD,
        }
    }
}

impl KeyManagerConfig {
    /// Path to a given user's vault file within `storage_dir`.
    pub fn vault_path(&self, user_id: &str) -> PathBuf {
        self.storage_dir.join(format!("{user_id}_vault.json"))
    }
}
