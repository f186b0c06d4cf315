use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::fetcher::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT};
use crate::identity::DEFAULT_CACHE_CAPACITY;
use crate::signer::DEFAULT_KEY_TTL;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/playurl-shim-env";
pub const DEFAULT_API_BASE: &str = "https://api.bilibili.com";

/// Raw values as written in the env file.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub state_db: Option<PathBuf>,
    pub api_base: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub cache_capacity: Option<usize>,
    pub key_ttl_secs: Option<u64>,
}

/// Settings with defaults applied.
#[derive(Debug, Clone)]
pub struct ShimConfig {
    /// SQLite file for the persisted state; `None` keeps state in memory.
    pub state_db: Option<PathBuf>,
    pub api_base: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub cache_capacity: usize,
    pub key_ttl: Duration,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            state_db: None,
            api_base: DEFAULT_API_BASE.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            key_ttl: DEFAULT_KEY_TTL,
        }
    }
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            match key.trim() {
                "STATE_DB" => {
                    if !value.is_empty() {
                        cfg.state_db = Some(PathBuf::from(value));
                    }
                }
                "API_BASE" => {
                    if !value.is_empty() {
                        cfg.api_base = Some(value.trim_end_matches('/').to_string());
                    }
                }
                "CONNECT_TIMEOUT_SECS" => {
                    cfg.connect_timeout_secs = Some(parse_number(path, key, value)?);
                }
                "READ_TIMEOUT_SECS" => {
                    cfg.read_timeout_secs = Some(parse_number(path, key, value)?);
                }
                "CACHE_CAPACITY" => {
                    cfg.cache_capacity = Some(parse_number(path, key, value)?);
                }
                "KEY_TTL_SECS" => {
                    cfg.key_ttl_secs = Some(parse_number(path, key, value)?);
                }
                _ => {}
            }
        }
    }
    Ok(Some(cfg))
}

fn parse_number<T>(path: &Path, key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Parsing {} from {}", key.trim(), path.display()))
}

pub fn load_shim_config() -> Result<ShimConfig> {
    load_shim_config_from(Path::new(DEFAULT_CONFIG_PATH))
}

/// A missing file yields the defaults.
pub fn load_shim_config_from(path: impl AsRef<Path>) -> Result<ShimConfig> {
    let path = path.as_ref();
    let Some(cfg) = read_env_config(path)? else {
        return Ok(ShimConfig::default());
    };
    let defaults = ShimConfig::default();
    Ok(ShimConfig {
        state_db: cfg.state_db,
        api_base: cfg.api_base.unwrap_or(defaults.api_base),
        connect_timeout: cfg
            .connect_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.connect_timeout),
        read_timeout: cfg
            .read_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.read_timeout),
        cache_capacity: cfg
            .cache_capacity
            .filter(|capacity| *capacity > 0)
            .unwrap_or(defaults.cache_capacity),
        key_ttl: cfg
            .key_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.key_ttl),
    })
}
