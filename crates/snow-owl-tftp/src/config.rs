//! Server configuration: bind address, retry/timeout defaults, the stats
//! callback interval, and socket buffer tuning.
//!
//! Trimmed from the teacher's `config.rs`: `MulticastConfig`,
//! `BatchConfig`/`ZeroCopyConfig`, and `WriteConfig` are dropped (RFC 2090
//! multicast and write support are out of scope; batch syscalls belong to
//! the worker-pool architecture this framework doesn't use).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{Result, TftpError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpServerConfig {
    pub root_dir: PathBuf,
    pub bind_addr: SocketAddr,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub stats_interval_secs: u64,
    pub logging: LoggingConfig,
    pub socket: SocketTuning,
    /// Maximum file size in bytes a handler may serve. 0 means unlimited.
    pub max_file_size_bytes: u64,
}

impl Default for TftpServerConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/snow-owl/tftp"),
            bind_addr: "0.0.0.0:69".parse().unwrap(),
            max_retries: crate::MAX_RETRIES,
            timeout_secs: crate::DEFAULT_TIMEOUT_SECS,
            stats_interval_secs: 60,
            logging: LoggingConfig::default(),
            socket: SocketTuning::default(),
            max_file_size_bytes: 104_857_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Listening-socket tuning knobs. Applied through `socket2` before the
/// raw socket is handed over, matching the teacher's
/// `create_optimized_socket` (`main.rs`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketTuning {
    pub reuse_address: bool,
    pub recv_buffer_bytes: usize,
    pub send_buffer_bytes: usize,
}

impl Default for SocketTuning {
    fn default() -> Self {
        Self {
            reuse_address: true,
            recv_buffer_bytes: 256 * 1024,
            send_buffer_bytes: 256 * 1024,
        }
    }
}

pub fn load_config(path: &std::path::Path) -> Result<TftpServerConfig> {
    let contents = std::fs::read_to_string(path)?;
    toml::from_str(&contents)
        .map_err(|e| TftpError::Tftp(format!("invalid config file {}: {e}", path.display())))
}

pub fn write_config(path: &std::path::Path, config: &TftpServerConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Tftp(format!("failed to serialize config: {e}")))?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn write_default_config(path: &std::path::Path) -> Result<()> {
    write_config(path, &TftpServerConfig::default())
}

/// Sanity-check a loaded configuration before the server binds.
pub fn validate_config(config: &TftpServerConfig) -> Result<()> {
    if !config.root_dir.is_absolute() {
        return Err(TftpError::Tftp("root_dir must be an absolute path".into()));
    }
    if config.max_retries == 0 {
        return Err(TftpError::Tftp("max_retries must be at least 1".into()));
    }
    if config.timeout_secs == 0 {
        return Err(TftpError::Tftp("timeout_secs must be at least 1".into()));
    }
    Ok(())
}
