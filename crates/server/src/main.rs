//! Mirrorline server
//!
//! Serves per-user state mirrors and RPC over WebSocket.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use mirrorline_server::logging::{init_logging, LogConfig, LogFormat};
use mirrorline_server::managers::standard_session;
use mirrorline_server::{MemoryStore, SessionOptions, SessionRegistry, SqliteStore, StateStore};

#[derive(Parser, Debug)]
#[command(name = "mirrorline")]
#[command(about = "Per-user state mirroring and RPC server", version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "MIRRORLINE_BIND", default_value = "127.0.0.1:4100")]
    bind: SocketAddr,

    /// SQLite database for manager state (in-memory when omitted)
    #[arg(long, env = "MIRRORLINE_DB")]
    db: Option<PathBuf>,

    /// Seconds between autosaves, 0 disables
    #[arg(long, env = "MIRRORLINE_AUTOSAVE_SECS", default_value_t = 30)]
    autosave_secs: u64,

    /// Per-RPC deadline in seconds, 0 disables
    #[arg(long, env = "MIRRORLINE_RPC_TIMEOUT_SECS", default_value_t = 0)]
    rpc_timeout_secs: u64,

    /// Directory for server.log (stderr when omitted)
    #[arg(long, env = "MIRRORLINE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[arg(long, env = "MIRRORLINE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

fn open_store(db: Option<&PathBuf>) -> anyhow::Result<Arc<dyn StateStore>> {
    match db {
        Some(path) => {
            let store = SqliteStore::open(path)
                .with_context(|| format!("failed to open state database {}", path.display()))?;
            info!(
                component = "store",
                event = "store.opened",
                path = %path.display(),
                "Using SQLite state store"
            );
            Ok(Arc::new(store))
        }
        None => {
            info!(
                component = "store",
                event = "store.opened",
                "Using in-memory state store, state is lost on exit"
            );
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _logging = init_logging(&LogConfig {
        dir: cli.log_dir.clone(),
        format: cli.log_format,
    })?;

    info!(
        component = "server",
        event = "server.starting",
        version = env!("CARGO_PKG_VERSION"),
        "Starting Mirrorline server"
    );

    let store = open_store(cli.db.as_ref())?;
    let options = SessionOptions {
        rpc_timeout: seconds(cli.rpc_timeout_secs),
    };
    let registry = Arc::new(
        SessionRegistry::new(move |user_id: &str| {
            standard_session(user_id, store.clone(), options.clone())
        })
        .with_autosave(seconds(cli.autosave_secs)),
    );

    let app = mirrorline_server::router(registry.clone());
    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("failed to bind {}", cli.bind))?;
    info!(
        component = "server",
        event = "server.listening",
        addr = %listener.local_addr()?,
        "Listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!(
                component = "server",
                event = "server.shutdown_requested",
                "Shutdown requested"
            );
        })
        .await?;

    let disposed = registry.dispose_all().await;
    info!(
        component = "server",
        event = "server.stopped",
        sessions_flushed = disposed,
        "Server stopped"
    );
    Ok(())
}
