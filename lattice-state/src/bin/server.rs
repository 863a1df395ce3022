use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use lattice_state::sync::StateManager;
use lattice_state::{transport, Config};

#[derive(Parser)]
#[command(name = "lattice-state-server")]
#[command(about = "Authoritative shared-state server")]
struct Cli {
    /// TOML config file with server settings and the keys to serve
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the config file
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(error = %err, "could not load config");
                return ExitCode::from(2);
            }
        },
        None => Config::default(),
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }

    let manager = StateManager::new(config.server.clone());
    for key in &config.keys {
        let validator = key.validator;
        if !validator.validate(&key.initial) {
            tracing::warn!(key = %key.name, ?validator, "initial value does not pass its own validator");
        }
        manager.register(key.name.clone(), key.initial.clone(), move |value| validator.validate(value));
    }

    let listener = match TcpListener::bind(config.server.bind).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(bind = %config.server.bind, error = %err, "could not bind");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = transport::serve(listener, manager) => {
            if let Err(err) = result {
                tracing::error!(error = %err, "server stopped");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }

    ExitCode::SUCCESS
}
