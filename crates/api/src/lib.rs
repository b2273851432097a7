/// The API crate serves the read-only HTTP gateway of the validator:
/// validated read queries, table metadata and transaction receipts, all
/// against committed block state.
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tabledger_core::config::GatewayConfig;
use tabledger_core::{Error, Result};
use tabledger_storage::GatewayStore;

pub mod http;
pub mod metadata;

/// HTTP gateway server
pub struct ApiServer {
    config: GatewayConfig,
    store: GatewayStore,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(config: GatewayConfig, store: GatewayStore) -> Self {
        Self { config, store }
    }

    /// Serve until the cancellation token fires, then drain in-flight
    /// requests.
    pub async fn start(self, cancel: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port)
            .parse::<SocketAddr>()
            .map_err(|e| Error::validation(format!("invalid gateway address: {e}")))?;

        let app = http::router(http::GatewayState::new(self.store, self.config));

        info!("starting gateway on {addr}");
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::storage(format!("failed to bind {addr}: {e}")))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| Error::storage(format!("gateway server error: {e}")))?;

        Ok(())
    }
}
