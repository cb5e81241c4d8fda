//! Demo embedder: a static-directory read-only TFTP server.
//!
//! The Rust counterpart of `fbtftp`'s `examples/server.py`
//! (`StaticHandler`/`StaticServer`/`FileResponseData` plus
//! `print_session_stats`/`print_server_stats`): it resolves requested
//! paths under a root directory, rejecting traversal and symlinks the
//! way the teacher's `validate_and_resolve_path` does, and wires the
//! library's `TftpServer` dispatcher up to a `clap` CLI.

mod config;

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use indexmap::IndexMap;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use snow_owl_tftp::config::{SocketTuning, TftpServerConfig};
use snow_owl_tftp::error::TftpError;
use snow_owl_tftp::server::{HandlerFactory, TftpServer};
use snow_owl_tftp::{ByteSource, ErrorCode, Handler};

#[derive(Parser)]
#[command(name = "snow-owl")]
#[command(about = "Dynamic read-only TFTP server", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/snow-owl/tftp.toml")]
    config: PathBuf,

    /// Write a default TOML configuration file to --config and exit.
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit without binding a socket.
    #[arg(long)]
    check_config: bool,

    /// Root directory to serve files from (overrides the config file).
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Bind address for the TFTP server (overrides the config file).
    #[arg(long)]
    bind: Option<SocketAddr>,
}

struct FileByteSource {
    file: File,
    size: u64,
}

impl ByteSource for FileByteSource {
    fn read(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let got = self.file.read(&mut buf)?;
        buf.truncate(got);
        Ok(buf)
    }

    fn size(&mut self) -> Option<u64> {
        Some(self.size)
    }

    fn close(&mut self) {
        let _ = self.file.seek(SeekFrom::Start(0));
    }
}

struct StaticHandler {
    root: PathBuf,
    filename: String,
    max_file_size_bytes: u64,
}

impl Handler for StaticHandler {
    fn get_response_data(&mut self) -> snow_owl_tftp::Result<Box<dyn ByteSource>> {
        let resolved_path = validate_and_resolve_path(&self.root, &self.filename)?;

        let file = File::open(&resolved_path)?;
        let size = file.metadata()?.len();
        if self.max_file_size_bytes > 0 && size > self.max_file_size_bytes {
            return Err(TftpError::Protocol(
                ErrorCode::DiskFull,
                format!("{} exceeds the configured size limit", self.filename),
            ));
        }
        Ok(Box::new(FileByteSource { file, size }))
    }
}

/// Resolve `filename` under `root`, rejecting traversal and symlinks.
/// Mirrors the teacher's `validate_and_resolve_path`.
fn validate_and_resolve_path(root: &Path, filename: &str) -> snow_owl_tftp::Result<PathBuf> {
    let filename = filename.replace('\\', "/");
    if filename.contains("..") {
        return Err(TftpError::Protocol(
            ErrorCode::AccessViolation,
            "path traversal is not permitted".to_string(),
        ));
    }
    let candidate = root.join(filename.trim_start_matches('/'));

    if let Ok(metadata) = std::fs::symlink_metadata(&candidate) {
        if metadata.file_type().is_symlink() {
            return Err(TftpError::Protocol(
                ErrorCode::AccessViolation,
                "symlinks are not permitted".to_string(),
            ));
        }
    }

    let canonical_root = root.canonicalize().map_err(|e| {
        TftpError::Protocol(ErrorCode::NotDefined, format!("bad root directory: {e}"))
    })?;
    let canonical_file = candidate.canonicalize().map_err(|_| {
        TftpError::Protocol(ErrorCode::FileNotFound, "File not found".to_string())
    })?;
    if !canonical_file.starts_with(&canonical_root) {
        return Err(TftpError::Protocol(
            ErrorCode::AccessViolation,
            "resolved path escapes the served root".to_string(),
        ));
    }

    Ok(candidate)
}

struct StaticHandlerFactory {
    root: PathBuf,
    max_file_size_bytes: u64,
}

impl HandlerFactory for StaticHandlerFactory {
    fn get_handler(
        &self,
        _server_addr: SocketAddr,
        _peer: SocketAddr,
        filename: &str,
        _options: &IndexMap<String, String>,
    ) -> Option<Box<dyn Handler>> {
        Some(Box::new(StaticHandler {
            root: self.root.clone(),
            filename: filename.to_string(),
            max_file_size_bytes: self.max_file_size_bytes,
        }))
    }
}

fn print_session_stats(stats: snow_owl_tftp::SessionStats) {
    tracing::info!(
        peer = %stats.peer,
        filename = %stats.filename,
        duration_ms = stats.duration().as_millis() as u64,
        packets_sent = stats.packets_sent,
        packets_acked = stats.packets_acked,
        bytes_sent = stats.bytes_sent,
        retransmitted = stats.had_retransmits(),
        error = ?stats.error,
        "session finished",
    );
}

fn print_server_stats(stats: &snow_owl_tftp::ServerStats) {
    let counters = stats.get_and_reset_all();
    tracing::info!(?counters, "server stats");
}

fn run(cli: Cli) -> Result<()> {
    if cli.init_config {
        config::save_config(&cli.config, &TftpServerConfig::default())
            .context("failed to write default configuration")?;
        println!("Wrote default configuration to {}", cli.config.display());
        return Ok(());
    }

    let mut cfg = config::load_config(&cli.config).unwrap_or_else(|_| TftpServerConfig::default());
    if let Some(root_dir) = cli.root_dir {
        cfg.root_dir = root_dir;
    }
    if let Some(bind) = cli.bind {
        cfg.bind_addr = bind;
    }
    snow_owl_tftp::config::validate_config(&cfg).context("invalid configuration")?;

    if cli.check_config {
        println!("Configuration OK: {cfg:#?}");
        return Ok(());
    }

    let factory = Arc::new(StaticHandlerFactory {
        root: cfg.root_dir.clone(),
        max_file_size_bytes: cfg.max_file_size_bytes,
    });

    let tuning = SocketTuning {
        reuse_address: cfg.socket.reuse_address,
        recv_buffer_bytes: cfg.socket.recv_buffer_bytes,
        send_buffer_bytes: cfg.socket.send_buffer_bytes,
    };

    let mut server = TftpServer::bind(
        cfg.bind_addr,
        &tuning,
        factory,
        cfg.max_retries,
        Duration::from_secs(cfg.timeout_secs.max(1)),
    )
    .context("failed to bind TFTP listener")?;
    server.on_session_complete(print_session_stats);
    let _timer = server.start_stats_timer(
        Duration::from_secs(cfg.stats_interval_secs.max(1)),
        print_server_stats,
    );

    snow_owl_tftp::audit::server_started(&cfg.bind_addr.to_string(), &cfg.root_dir.display().to_string());
    tracing::info!(bind = %cfg.bind_addr, root = %cfg.root_dir.display(), "starting tftp server");
    server.run().context("tftp server stopped")
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    run(cli)
}
