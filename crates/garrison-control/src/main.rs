use std::sync::Arc;

use garrison_control::audit::TracingAudit;
use garrison_control::config::{ControlConfig, LedgerBackend};
use garrison_control::ledger::{MemoryLedger, SeaLedger, SharedLedger};
use garrison_control::routes;
use garrison_control::state::AppState;

async fn init_ledger(config: &ControlConfig) -> anyhow::Result<SharedLedger> {
    match (config.ledger, config.database_url.as_deref()) {
        (LedgerBackend::Postgres, Some(url)) => {
            // schema is provisioned out of band
            let db = garrison_db::connect(url).await?;
            Ok(Arc::new(SeaLedger::new(Arc::new(db))))
        }
        (LedgerBackend::Postgres, None) => {
            anyhow::bail!("DATABASE_URL is required for the postgres ledger")
        }
        (LedgerBackend::Memory, _) => {
            tracing::warn!("using the in-memory ledger; server records are lost on restart");
            Ok(Arc::new(MemoryLedger::new()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(%err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ControlConfig::from_env()?;
    let addr = config.listen_addr;
    let ledger = init_ledger(&config).await?;
    let state = AppState::new(config, ledger, Arc::new(TracingAudit));

    if let Some(poller) = state.poller() {
        poller.spawn();
    }

    let app = routes::router(state);
    tracing::info!(%addr, "garrison-control HTTP listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
