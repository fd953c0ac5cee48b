//! Metadata manager configuration

use serde::{Deserialize, Serialize};

/// Tunables for one metadata manager instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Maximum documents removed per deleter invocation
    #[serde(default = "default_max_delete_batch")]
    pub max_delete_batch: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_delete_batch: default_max_delete_batch(),
        }
    }
}

fn default_max_delete_batch() -> usize {
    128
}
