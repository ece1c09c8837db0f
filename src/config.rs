use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    pub ws_bind: String,
    pub storage_path: Option<PathBuf>,
    pub rules_path: Option<PathBuf>,
    pub storage_poll_ms: u64,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            ws_bind: "127.0.0.1:38110".to_owned(),
            storage_path: None,
            rules_path: None,
            storage_poll_ms: 750,
        }
    }
}

impl SwitchConfig {
    pub fn load_or_create() -> Result<(Self, PathBuf)> {
        let config_dir = dirs::config_dir()
            .context("unable to locate OS config directory")?
            .join("cardart-switch");
        fs::create_dir_all(&config_dir)
            .with_context(|| format!("failed creating config dir at {}", config_dir.display()))?;

        let config_path = config_dir.join("config.json");
        if !config_path.exists() {
            let default = Self::default();
            default.save(&config_path)?;
            return Ok((default, config_path));
        }

        let text = fs::read_to_string(&config_path)
            .with_context(|| format!("failed reading {}", config_path.display()))?;
        let config = serde_json::from_str::<Self>(&text)
            .with_context(|| format!("invalid json in {}", config_path.display()))?;
        Ok((config, config_path))
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        let payload = serde_json::to_string_pretty(self).context("failed serializing config")?;
        fs::write(path, payload).with_context(|| format!("failed writing {}", path.display()))?;
        Ok(())
    }

    // The toggle and rule documents live beside the config file unless an
    // override points elsewhere.
    pub fn storage_document(&self, config_path: &Path) -> PathBuf {
        self.storage_path
            .clone()
            .unwrap_or_else(|| config_path.with_file_name("storage.json"))
    }

    pub fn rules_document(&self, config_path: &Path) -> PathBuf {
        self.rules_path
            .clone()
            .unwrap_or_else(|| config_path.with_file_name("rules.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::SwitchConfig;
    use std::path::PathBuf;

    #[test]
    fn parses_a_minimal_config_with_defaults() {
        let raw = r#"{
            "ws_bind": "127.0.0.1:40001"
        }"#;
        let parsed: SwitchConfig = serde_json::from_str(raw).expect("config should parse");
        assert_eq!(parsed.ws_bind, "127.0.0.1:40001");
        assert_eq!(parsed.storage_path, None);
        assert_eq!(parsed.rules_path, None);
        assert_eq!(parsed.storage_poll_ms, 750);
    }

    #[test]
    fn documents_default_to_config_siblings() {
        let config = SwitchConfig::default();
        let config_path = PathBuf::from("/tmp/cardart-switch/config.json");
        assert_eq!(
            config.storage_document(&config_path),
            PathBuf::from("/tmp/cardart-switch/storage.json")
        );
        assert_eq!(
            config.rules_document(&config_path),
            PathBuf::from("/tmp/cardart-switch/rules.json")
        );
    }

    #[test]
    fn document_overrides_win_over_sibling_defaults() {
        let raw = r#"{
            "storage_path": "/var/lib/cardart/toggle.json",
            "rules_path": "/var/lib/cardart/rules.json"
        }"#;
        let parsed: SwitchConfig = serde_json::from_str(raw).expect("config should parse");
        let config_path = PathBuf::from("/tmp/cardart-switch/config.json");
        assert_eq!(
            parsed.storage_document(&config_path),
            PathBuf::from("/var/lib/cardart/toggle.json")
        );
        assert_eq!(
            parsed.rules_document(&config_path),
            PathBuf::from("/var/lib/cardart/rules.json")
        );
    }
}
