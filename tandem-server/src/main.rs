//! Tandem server — shared text editing over WebSocket.
//!
//! Usage:
//!   # One text file per workspace under ./workspaces
//!   cargo run -p tandem-server
//!
//!   # Directory trees, writable by everyone who joins
//!   cargo run -p tandem-server -- --mode tree --root /srv/projects --grant-write
//!
//! Log verbosity follows `RUST_LOG` and defaults to `info`.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use tandem_collab::server::{ServerConfig, SyncServer};
use tandem_collab::storage::DEFAULT_README;
use tandem_collab::workspace::WorkspaceMode;
use tandem_core::OffsetUnit;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    /// Each workspace is a single text file
    Single,
    /// Each workspace is a directory of files
    Tree,
}

impl From<Mode> for WorkspaceMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Single => WorkspaceMode::Single,
            Mode::Tree => WorkspaceMode::Tree,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Unit {
    /// UTF-16 code units, as browser editors count
    Utf16,
    /// Unicode scalar values
    Char,
    /// UTF-8 bytes
    Byte,
}

impl From<Unit> for OffsetUnit {
    fn from(unit: Unit) -> Self {
        match unit {
            Unit::Utf16 => OffsetUnit::Utf16,
            Unit::Char => OffsetUnit::Char,
            Unit::Byte => OffsetUnit::Byte,
        }
    }
}

/// Collaborative text editing server.
#[derive(Parser, Debug)]
#[command(name = "tandem-server")]
#[command(about = "Real-time shared editing over WebSocket")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Directory holding the workspaces
    #[arg(short, long, default_value = "workspaces")]
    root: PathBuf,

    /// What a workspace name refers to
    #[arg(long, value_enum, default_value_t = Mode::Single)]
    mode: Mode,

    /// Queued messages per workspace before slow clients start missing some
    #[arg(long, default_value_t = 256)]
    capacity: usize,

    /// Seconds between writes of a workspace that keeps changing
    #[arg(long, default_value_t = 10)]
    save_interval: u64,

    /// Seconds between idle autosave sweeps
    #[arg(long, default_value_t = 5)]
    autosave_tick: u64,

    /// How clients count edit offsets
    #[arg(long, value_enum, default_value_t = Unit::Utf16)]
    offset_unit: Unit,

    /// Give every joining client write permission
    #[arg(long)]
    grant_write: bool,

    /// File whose contents seed the README of new tree workspaces
    #[arg(long)]
    readme: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> std::io::Result<ServerConfig> {
        let readme_template = match &self.readme {
            Some(path) => std::fs::read_to_string(path)?,
            None => DEFAULT_README.to_string(),
        };
        Ok(ServerConfig {
            bind_addr: self.bind,
            workspace_root: self.root,
            mode: self.mode.into(),
            broadcast_capacity: self.capacity.max(1),
            save_interval: Duration::from_secs(self.save_interval),
            autosave_tick: Duration::from_secs(self.autosave_tick.max(1)),
            offset_unit: self.offset_unit.into(),
            grant_write: self.grant_write,
            readme_template,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.into_config()?;
    std::fs::create_dir_all(&config.workspace_root)?;
    log::info!("Serving workspaces from {}", config.workspace_root.display());

    let server = SyncServer::new(config);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, saving open workspaces");
        }
    }
    server.shutdown().await;
    Ok(())
}
