//! Gateway configuration: load a JSON file if present, filling in any field missing from an
//! older file with its default and rewriting the file when that happens; otherwise generate
//! one from defaults and persist it.

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

fn default_ssdp_search_cycle_secs() -> u64 {
    30
}

fn default_ssdp_notify_cycle_secs() -> u64 {
    60
}

fn default_ws_bind() -> SocketAddr {
    "0.0.0.0:8081".parse().expect("valid static socket addr")
}

fn default_mjpeg_bind() -> SocketAddr {
    "0.0.0.0:8082".parse().expect("valid static socket addr")
}

fn default_seed_path() -> String {
    "seed_cameras.json".to_string()
}

fn default_wsdiscovery_timeout_secs() -> u64 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_ws_bind")]
    pub ws_bind: SocketAddr,
    #[serde(default = "default_mjpeg_bind")]
    pub mjpeg_bind: SocketAddr,
    #[serde(default = "default_seed_path")]
    pub seed_path: String,
    #[serde(default = "default_ssdp_search_cycle_secs")]
    pub ssdp_search_cycle_secs: u64,
    #[serde(default = "default_ssdp_notify_cycle_secs")]
    pub ssdp_notify_cycle_secs: u64,
    #[serde(default = "default_wsdiscovery_timeout_secs")]
    pub wsdiscovery_timeout_secs: u64,
    #[serde(default)]
    pub own_usn: String,
    #[serde(default)]
    pub own_location: String,
    #[serde(default)]
    pub ssdp_search_targets: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_bind: default_ws_bind(),
            mjpeg_bind: default_mjpeg_bind(),
            seed_path: default_seed_path(),
            ssdp_search_cycle_secs: default_ssdp_search_cycle_secs(),
            ssdp_notify_cycle_secs: default_ssdp_notify_cycle_secs(),
            wsdiscovery_timeout_secs: default_wsdiscovery_timeout_secs(),
            own_usn: String::new(),
            own_location: String::new(),
            ssdp_search_targets: vec!["urn:schemas-onvif-org:device:NetworkVideoTransmitter:1".to_string()],
        }
    }
}

impl Config {
    /// Load `path` if it exists, otherwise write out and return the defaults. An existing
    /// file missing newer fields is rewritten with them filled in: if re-serializing the
    /// defaults-filled config doesn't match the file's own text, the file is stale and gets
    /// persisted back.
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let config: Self = serde_json::from_str(&text)?;
            let filled = serde_json::to_string_pretty(&config)?;
            if filled.trim() != text.trim() {
                config.persist(path)?;
            }
            Ok(config)
        } else {
            let config = Self::default();
            config.persist(path)?;
            Ok(config)
        }
    }

    pub fn persist(&self, path: &Path) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bind_to_distinct_ports() {
        let config = Config::default();
        assert_ne!(config.ws_bind.port(), config.mjpeg_bind.port());
    }

    #[test]
    fn missing_fields_fall_back_to_defaults_on_deserialize() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.seed_path, default_seed_path());
    }

    #[test]
    fn stale_file_missing_fields_is_rewritten_with_defaults() {
        let dir = std::env::temp_dir().join(format!("cctv-gateway-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, "{}").unwrap();

        let config = Config::load_or_create(&path).unwrap();
        assert_eq!(config.seed_path, default_seed_path());

        let rewritten = std::fs::read_to_string(&path).unwrap();
        assert_ne!(rewritten.trim(), "{}");
        assert!(rewritten.contains("seed_path"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
