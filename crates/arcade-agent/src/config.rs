//! Agent configuration file: a TOML file at `~/.config/arcade/agent.toml`,
//! written by `arcade-agent register` and read by `arcade-agent start`.
//! Modeled directly on the teacher's `cmd_init`/`save_config` pair: write
//! with `0600` permissions, create the parent directory if absent.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub grpc: GrpcSection,
    #[serde(default)]
    pub agent: AgentSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrpcSection {
    #[serde(default)]
    pub server_addr: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: i32,
}

fn default_interval() -> u64 {
    30
}

fn default_max_concurrent_jobs() -> i32 {
    4
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: None,
            interval: default_interval(),
            labels: HashMap::new(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("arcade");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("arcade")
}

pub fn config_path() -> PathBuf {
    config_dir().join("agent.toml")
}

pub fn load_config(path: &std::path::Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents).context("failed to parse config file")
}

/// Write the config file, creating its parent directory if needed and
/// restricting permissions to the owner on unix.
pub fn save_config(path: &std::path::Path, config: &ConfigFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("failed to open config file at {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata()?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_section_defaults() {
        let section = AgentSection::default();
        assert_eq!(section.interval, 30);
        assert_eq!(section.max_concurrent_jobs, 4);
        assert!(section.id.is_none());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");

        let mut config = ConfigFile::default();
        config.grpc.server_addr = "example.com:9090".to_string();
        config.grpc.token = "abc123".to_string();
        config.agent.id = Some(Uuid::new_v4());
        config.agent.interval = 15;

        save_config(&path, &config).unwrap();
        let loaded = load_config(&path).unwrap();

        assert_eq!(loaded.grpc.server_addr, "example.com:9090");
        assert_eq!(loaded.grpc.token, "abc123");
        assert_eq!(loaded.agent.interval, 15);
        assert_eq!(loaded.agent.id, config.agent.id);
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        save_config(&path, &ConfigFile::default()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
