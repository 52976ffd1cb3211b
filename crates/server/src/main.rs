use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use dl_server::api;
use dl_server::cli::{
    self, bootstrap, keys, Cli, Command, EXIT_BAD_CONFIG, EXIT_BIND_FAILED, EXIT_MISSING_KEYS,
};
use dl_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    match args.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            serve().await
        }
        Some(Command::Bootstrap {
            config_dir,
            include_remote_keys,
        }) => {
            let dir = cli::config_dir(config_dir.as_deref());
            if let Err(e) = bootstrap::run(&dir, include_remote_keys) {
                eprintln!("bootstrap failed: {e}");
                std::process::exit(EXIT_BAD_CONFIG);
            }
            Ok(())
        }
        Some(Command::GenerateKeys { dir }) => {
            if let Err(e) = keys::generate(&dir) {
                eprintln!("generate-keys failed: {e}");
                std::process::exit(EXIT_MISSING_KEYS);
            }
            Ok(())
        }
    }
}

/// Structured JSON tracing for the server process.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,dl_server=debug")),
        )
        .json()
        .init();
}

async fn serve() -> anyhow::Result<()> {
    let dir = cli::config_dir(None);

    let config = match cli::load_config(&dir) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration failed to load");
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };

    let keys_dir = dir.join(&config.local_keys_dir);
    if !keys_dir.join("signing.key").exists() {
        tracing::error!(
            dir = %keys_dir.display(),
            "no server key bundle found; run `drawlatch bootstrap` or `drawlatch generate-keys`"
        );
        std::process::exit(EXIT_MISSING_KEYS);
    }

    let state = match AppState::build(config, &dir) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "server state failed to build");
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };

    tracing::info!(
        fingerprint = %state.fingerprint,
        callers = state.config.callers.len(),
        "drawlatch remote starting"
    );

    // ── Background services ──────────────────────────────────────────
    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());
    state.sessions.spawn_sweeper(shutdown.clone());
    state.ingestors.start_all(&state.config).await;

    // ── HTTP surface ─────────────────────────────────────────────────
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind");
            state.ingestors.stop_all().await;
            std::process::exit(EXIT_BIND_FAILED);
        }
    };
    tracing::info!(addr = %addr, "listening");

    let app = api::router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    // ── Drain ────────────────────────────────────────────────────────
    tracing::info!("shutting down: stopping ingestors and closing sessions");
    state.ingestors.stop_all().await;
    state.sessions.clear();
    Ok(())
}

/// Cancel the shutdown token on SIGINT or SIGTERM.
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("shutdown signal received");
        cancel.cancel();
    });
}
