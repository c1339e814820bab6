//! Daemon configuration: CLI flags layered over an optional TOML file.
//!
//! Grounded in the teacher's `ServerConfig` (`server/src/config.rs`):
//! `load`/`load_or_default`/`save`/`default_path`, a `validate()` pass, and
//! the same "CLI flag wins over file value" layering used in `main.rs`.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub server: ServerSettings,
    pub capture: CaptureSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Path to write a PcapNG capture to. `None` disables the sink
    /// entirely (`spec.md` §4.F: "optional").
    pub path: Option<PathBuf>,
    pub snaplen: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                bind_addr: "0.0.0.0:3240".to_string(),
                log_level: "info".to_string(),
            },
            capture: CaptureSettings {
                path: None,
                snaplen: 65535,
            },
        }
    }
}

impl DaemonConfig {
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = [Self::default_path(), PathBuf::from("/etc/usbipd/usbipd.toml")];
            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("no configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config file: {}", config_path.display()))?;
        let config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", config_path.display()))?;
        config.validate()?;

        tracing::info!("loaded configuration from {}", config_path.display());
        Ok(config)
    }

    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("failed to load config: {e}, using defaults");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize configuration")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
        }
        fs::write(path, content)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        tracing::info!("saved configuration to {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(dir) = dirs::config_dir() {
            dir.join("usbipd").join("usbipd.toml")
        } else {
            PathBuf::from(".config/usbipd/usbipd.toml")
        }
    }

    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }
        self.server
            .bind_addr
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("invalid bind_addr '{}'", self.server.bind_addr))?;
        if self.capture.snaplen == 0 {
            return Err(anyhow!("capture.snaplen must be non-zero"));
        }
        Ok(())
    }
}
