//! bosun-server: WebSocket process orchestration server.
//!
//! Accepts WebSocket connections and routes them by upgrade path:
//! `/shell` (PTY-backed shells), `/ws` (assistant CLI sessions), and
//! `/devserver` (project dev-server control and log streaming). All
//! process supervision lives in the library crates; this binary is
//! wiring and policy flags.

mod connection;
mod handlers;
mod router;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

use bosun_session::{
    AssistantConfig, AssistantManager, DevServerConfig, DevServerManager, NullHistory,
    PackageManifestStore, ShellConfig, ShellManager,
};

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "bosun-server", about = "WebSocket shell, assistant, and dev-server host")]
struct Args {
    /// Port to listen on.
    #[arg(short, long, default_value_t = 3001)]
    port: u16,

    /// Seconds to wait between graceful and forced termination.
    #[arg(long, default_value_t = 5)]
    grace: u64,

    /// Assistant CLI binary.
    #[arg(long, default_value = "claude")]
    claude_bin: String,

    /// Keep assistant runs alive when their connection drops (they stay
    /// resumable); pass `false` to interrupt them instead.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    assistant_detach: bool,

    /// Root directory for relative project identifiers. Defaults to the
    /// home directory.
    #[arg(long)]
    project_root: Option<PathBuf>,

    /// Shell binary override (defaults to $SHELL, then /bin/sh).
    #[arg(long)]
    shell: Option<String>,

    /// Dev-server launcher binary.
    #[arg(long, default_value = "npm")]
    devserver_command: String,

    /// Seconds to wait for a dev-server port before reporting it running
    /// without a URL.
    #[arg(long, default_value_t = 30)]
    readiness_timeout: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bosun_server=info".into()),
        )
        .init();

    let args = Args::parse();
    let grace = Duration::from_secs(args.grace);

    let project_root = args
        .project_root
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    let projects = Arc::new(PackageManifestStore::new(project_root));

    let state = AppState {
        shell: ShellManager::new(ShellConfig {
            shell: args.shell,
            grace_period: grace,
        }),
        assistant: AssistantManager::new(
            AssistantConfig {
                binary: args.claude_bin,
                grace_period: grace,
            },
            projects.clone(),
            Arc::new(NullHistory),
        ),
        devserver: DevServerManager::new(
            DevServerConfig {
                command: args.devserver_command,
                grace_period: grace,
                readiness_timeout: Duration::from_secs(args.readiness_timeout),
                ..Default::default()
            },
            projects,
        ),
        assistant_detach: args.assistant_detach,
    };

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .expect("Failed to bind TCP listener");

    tracing::info!("bosun-server listening on {}", addr);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    // Capture the upgrade path and query for routing.
                    let mut path = String::new();
                    let mut query: Option<String> = None;
                    let callback = |req: &Request, resp: Response| {
                        path = req.uri().path().to_string();
                        query = req.uri().query().map(str::to_string);
                        Ok(resp)
                    };
                    match accept_hdr_async(stream, callback).await {
                        Ok(ws) => router::route(ws, &path, query.as_deref(), state).await,
                        Err(e) => {
                            tracing::warn!(peer = %addr, error = %e, "WS handshake failed");
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept error");
            }
        }
    }
}
