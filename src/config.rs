//! File-backed configuration store.
//!
//! The store holds a flat JSON object keyed by the configuration keys the
//! agent understands. Values are re-validated on load; invalid entries are
//! logged and ignored, keeping the defaults.

use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::debug;

use wayfinder_agent::config::ConfigEffect;
use wayfinder_agent::AgentConfig;

pub struct ConfigStore {
    path: PathBuf,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Platform config directory, e.g. `~/.config/wayfinder/config.json`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("wayfinder")
            .join("config.json")
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Raw stored key/value map; a missing file is an empty map.
    pub fn load_raw(&self) -> Result<Map<String, Value>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no config file; using defaults");
                return Ok(Map::new());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading config file {}", self.path.display()))
            }
        };
        let value: Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing config file {}", self.path.display()))?;
        value
            .as_object()
            .cloned()
            .context("config file must contain a JSON object")
    }

    /// Validated configuration built from the stored map.
    pub fn load(&self) -> Result<AgentConfig> {
        Ok(AgentConfig::from_map(&self.load_raw()?))
    }

    /// Apply every stored entry against a fresh config and report the keys
    /// whose values were ignored as invalid.
    pub fn rejected_keys(&self) -> Result<Vec<String>> {
        let mut config = AgentConfig::default();
        let mut rejected = Vec::new();
        for (key, value) in self.load_raw()? {
            if config.apply_update(&key, &value) == ConfigEffect::Ignored {
                rejected.push(key);
            }
        }
        Ok(rejected)
    }
}
