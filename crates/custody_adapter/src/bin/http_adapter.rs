#![forbid(unsafe_code)]

use std::{
    env,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use custody_adapter::{ledger_dir_from_env, router, LedgerServiceRuntime};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let bind = env::var("CUSTODY_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8088".to_string());
    let addr: SocketAddr = bind.parse()?;

    let runtime = Arc::new(Mutex::new(LedgerServiceRuntime::default_from_env()?));
    let blob_max_bytes = runtime
        .lock()
        .map(|r| r.blob_max_bytes())
        .unwrap_or_default();
    let app = router(runtime);

    tracing::info!(
        %addr,
        blob_max_bytes,
        ledger_dir = %ledger_dir_from_env().display(),
        "custody ledger http adapter listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;
    Ok(())
}
