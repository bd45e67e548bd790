use std::io::{self, BufRead, Write};
use std::sync::Arc;

use sharebox_crypto::FileKeyStore;
use sharebox_server::{AppState, IntegrityPolicy, Server, ServerConfig, ServerError};
use sharebox_store::{IntegrityGuard, MetadataStore, WORKSPACES_DIR, WorkspaceStorage};
use tracing::{error, info};

/// Exit status after an integrity violation.
const EXIT_INTEGRITY: i32 = 2;

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sharebox_server=debug,sharebox_store=info,sharebox_transfer=info".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let passphrase = match config.admin_passphrase.clone() {
        Some(passphrase) => passphrase,
        None => prompt("Integrity passphrase: ")?,
    };
    if passphrase.is_empty() {
        eprintln!("FATAL: an integrity passphrase is required.");
        eprintln!("       Set SHAREBOX_ADMIN_PASSPHRASE or enter one at the prompt.");
        std::process::exit(1);
    }

    let consent = || match config.integrity {
        IntegrityPolicy::Enforce => true,
        IntegrityPolicy::Disable => false,
        IntegrityPolicy::Prompt => prompt("No integrity tags found. Enable metadata integrity checks? [y/N] ")
            .map(|answer| matches!(answer.trim(), "y" | "Y" | "yes"))
            .unwrap_or(false),
    };

    std::fs::create_dir_all(&config.data_dir)?;
    let guard = match IntegrityGuard::open(&config.data_dir, &passphrase, &config.kdf, consent) {
        Ok((guard, startup)) => {
            info!("Integrity: {:?}", startup);
            guard
        }
        Err(e) if e.is_fatal() => {
            error!("Refusing to start: {}", e);
            std::process::exit(EXIT_INTEGRITY);
        }
        Err(e) => return Err(e.into()),
    };

    let metadata = MetadataStore::open(&config.data_dir, guard, config.kdf)?;
    let storage = WorkspaceStorage::open(config.data_dir.join(WORKSPACES_DIR))?;
    storage.sweep()?;
    let keys = FileKeyStore::open(&config.keys_dir)?.with_params(config.kdf);
    info!("Public keys read from {}", keys.dir().display());

    let state = Arc::new(AppState { metadata, storage, keys: Arc::new(keys) });
    let server = Server::bind(config.bind_addr(), state, config.connection_options())?;

    match server.run() {
        Ok(()) => Ok(()),
        Err(ServerError::IntegrityViolation) => {
            error!("Metadata was modified outside the server; exiting");
            std::process::exit(EXIT_INTEGRITY);
        }
        Err(e) => Err(e.into()),
    }
}

fn prompt(message: &str) -> io::Result<String> {
    print!("{message}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
