//! CodeRoom server binary.
//!
//! Configuration comes from `CODEROOM_*` environment variables (a `.env`
//! file is honoured) and logging from `RUST_LOG`.

use std::sync::Arc;

use coderoom_collab::{CodeRoomServer, ProcessExecutor, RejectAllVerifier, TokenVerifier};

mod config;

use config::AppConfig;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    if let Err(e) = run().await {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = AppConfig::from_env()?;

    let verifier: Arc<dyn TokenVerifier> = match config.tokens {
        Some(tokens) => {
            log::info!("Loaded {} login tokens", tokens.len());
            Arc::new(tokens)
        }
        None => Arc::new(RejectAllVerifier),
    };
    log::info!(
        "Sandbox configured for {} languages",
        config.sandbox.commands.len()
    );
    let executor = Arc::new(ProcessExecutor::new(config.sandbox));
    let default_language = config.server.room_defaults.language;
    if !executor.supports(default_language) {
        log::warn!("No sandbox command for the default language {default_language}; runs will fail");
    }

    let server = CodeRoomServer::new(config.server, executor, verifier)?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
        }
    }

    let saved = server.archive_all().await;
    if saved > 0 {
        log::info!("Archived {saved} rooms");
    }
    Ok(())
}
