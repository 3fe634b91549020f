use std::error::Error;

use clap::Parser;

use tandem::config::{KeyCustody, RelayCli, RelayConfig};
use tandem::relay::{app, RelayState};
use tandem::storage::Storage;

#[tokio::main]
async fn main() {
    tandem::logging::init();
    if let Err(error) = run().await {
        tracing::error!("relay: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let config = RelayConfig::from_cli_and_env(RelayCli::parse())?;

    let db_path = config.database_path();
    let storage = Storage::open(&db_path)?.into_shared();
    tracing::info!("relay: database {}", db_path.display());

    if config.key_custody == KeyCustody::Escrowed {
        tracing::warn!(
            "relay: key custody is escrowed; this server holds every user's private key"
        );
    }

    let bind = config.bind_addr.clone();
    let state = RelayState::from_config(config, storage).await?;
    tracing::info!("relay: connection gate `{}`", state.gate_name());

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| format!("failed to bind {bind}: {e}"))?;
    tracing::info!("relay: listening on {}", listener.local_addr()?);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("relay: shutting down");
        })
        .await?;
    Ok(())
}
