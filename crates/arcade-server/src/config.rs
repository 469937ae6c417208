//! Control plane configuration file: a TOML file at
//! `~/.config/arcade/server.toml` plus env var and CLI flag overrides,
//! resolved CLI flag > env var > config file > default, same chain the
//! teacher's config module uses.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use arcade_db::config::DbConfig;

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub auth: AuthSection,
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded API key agents derive their signing key from.
    pub api_key_hex: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default = "default_stale_after_secs")]
    pub stale_agent_after_secs: i64,
}

fn default_rpc_port() -> u16 {
    9090
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_queue_name() -> String {
    "default".to_string()
}
fn default_stale_after_secs() -> i64 {
    180
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            rpc_port: default_rpc_port(),
            http_port: default_http_port(),
            metrics_port: default_metrics_port(),
            bind: default_bind(),
            queue_name: default_queue_name(),
            stale_agent_after_secs: default_stale_after_secs(),
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
    config_dir().join("server.toml")
}

pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents).context("failed to parse config file")
}

/// Resolved runtime configuration: a config file merged with an explicit
/// database URL override (CLI flag or env var).
pub struct ResolvedConfig {
    pub db_config: DbConfig,
    pub api_key: Vec<u8>,
    pub server: ServerSection,
}

impl ResolvedConfig {
    pub fn resolve(database_url_override: Option<&str>) -> Result<Self> {
        if let Some(url) = database_url_override.map(str::to_string).or_else(|| std::env::var("ARCADE_DATABASE_URL").ok()) {
            let file = load_config().ok();
            return Ok(Self {
                db_config: DbConfig::new(url),
                api_key: file
                    .as_ref()
                    .map(|f| decode_api_key(&f.auth.api_key_hex))
                    .transpose()?
                    .unwrap_or_else(|| b"arcade-dev-insecure-key".to_vec()),
                server: file.map(|f| f.server).unwrap_or_default(),
            });
        }

        let file = load_config()?;
        Ok(Self {
            db_config: DbConfig::new(file.database.url.clone()),
            api_key: decode_api_key(&file.auth.api_key_hex)?,
            server: file.server,
        })
    }
}

fn decode_api_key(hex_str: &str) -> Result<Vec<u8>> {
    hex::decode(hex_str).context("api_key_hex is not valid hex")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_section_defaults_are_sane() {
        let section = ServerSection::default();
        assert_eq!(section.rpc_port, 9090);
        assert_eq!(section.http_port, 8080);
        assert_eq!(section.bind, "0.0.0.0");
    }

    #[test]
    fn decode_api_key_rejects_non_hex() {
        assert!(decode_api_key("not hex!!").is_err());
    }

    #[test]
    fn decode_api_key_roundtrips() {
        let key = decode_api_key("deadbeef").unwrap();
        assert_eq!(key, vec![0xde, 0xad, 0xbe, 0xef]);
    }
}
