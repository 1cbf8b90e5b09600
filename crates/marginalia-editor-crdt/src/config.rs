use miette::{Result, miette};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use marginalia_editor_core::Affinity;

/// Engine configuration.
///
/// Every field has a default, so an empty JSON object is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Loro peer id for this replica. Random when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<u64>,

    /// Name of the rich-text container holding the document.
    #[serde(default = "default_text_container")]
    pub text_container: SmolStr,

    /// Affinity used to move the local selection through local edits.
    #[serde(default = "default_local_affinity")]
    pub local_affinity: Affinity,

    /// Affinity used to move selections through remote changes.
    #[serde(default = "default_remote_affinity")]
    pub remote_affinity: Affinity,

    /// Refuse local edits until the attached session first reports synced.
    #[serde(default = "default_gate")]
    pub gate_until_synced: bool,
}

fn default_text_container() -> SmolStr {
    SmolStr::new_static("content")
}

fn default_local_affinity() -> Affinity {
    Affinity::After
}

fn default_remote_affinity() -> Affinity {
    Affinity::Before
}

fn default_gate() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            text_container: default_text_container(),
            local_affinity: default_local_affinity(),
            remote_affinity: default_remote_affinity(),
            gate_until_synced: default_gate(),
        }
    }
}

impl EngineConfig {
    /// Parse a config from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| miette!("invalid engine config: {e}"))
    }

    pub fn with_peer_id(mut self, peer_id: u64) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    pub fn ungated(mut self) -> Self {
        self.gate_until_synced = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.text_container, "content");
        assert_eq!(config.local_affinity, Affinity::After);
        assert_eq!(config.remote_affinity, Affinity::Before);
        assert!(config.gate_until_synced);
    }

    #[test]
    fn test_partial_json() {
        let config = EngineConfig::from_json(
            r#"{ "peer_id": 7, "remote_affinity": "after", "gate_until_synced": false }"#,
        )
        .unwrap();
        assert_eq!(config.peer_id, Some(7));
        assert_eq!(config.remote_affinity, Affinity::After);
        assert!(!config.gate_until_synced);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(EngineConfig::from_json(r#"{ "peer_id": "seven" }"#).is_err());
    }
}
