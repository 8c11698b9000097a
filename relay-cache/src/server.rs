//! Cache server bootstrap
//!
//! Wires the index, blob storage and router together and serves them on a
//! background task. The server lives as long as the [`CacheServer`] handle.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{self, AppState};
use crate::config::CacheConfig;
use crate::db;
use crate::service::cache_service::CacheService;
use crate::storage::Storage;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to prepare cache directory {path}: {source}")]
    Directory {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to open cache index: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to detect outbound address: {0}")]
    OutboundAddr(std::io::Error),

    #[error("failed to bind cache server: {0}")]
    Bind(std::io::Error),
}

/// Handle to a running cache server
pub struct CacheServer {
    external_url: String,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl CacheServer {
    /// Opens the cache at `config.dir` and starts serving it
    pub async fn start(config: CacheConfig) -> Result<Self, ServerError> {
        let directory = |source| ServerError::Directory {
            path: config.dir.display().to_string(),
            source,
        };
        tokio::fs::create_dir_all(&config.dir)
            .await
            .map_err(directory)?;

        let pool = db::create_pool(&config.index_path()).await?;
        db::run_migrations(&pool).await?;
        let storage = Storage::new(config.blob_dir()).await.map_err(directory)?;

        let service = Arc::new(CacheService::new(pool, storage, &config));
        if let Some(report) = service.gc().await {
            tracing::debug!("Startup sweep removed {:?}", report);
        }

        let host = match &config.host {
            Some(host) => host.clone(),
            None => outbound_ip().map_err(ServerError::OutboundAddr)?.to_string(),
        };

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port))
            .await
            .map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;
        let external_url = format!("http://{}:{}", host, local_addr.port());

        let router = api::create_router(AppState {
            service: service.clone(),
            external_url: external_url.clone(),
        });

        let shutdown = CancellationToken::new();
        spawn_periodic_gc(service.clone(), config.gc_interval, shutdown.clone());

        let signal = shutdown.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(signal.cancelled_owned())
                .await
            {
                tracing::error!("Cache server stopped: {}", e);
            }
        });

        tracing::info!("Cache server listening on {} ({})", local_addr, external_url);

        Ok(Self {
            external_url,
            local_addr,
            shutdown,
            handle,
        })
    }

    /// Base URL jobs use to reach the cache, without a trailing slash
    pub fn external_url(&self) -> &str {
        &self.external_url
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for in-flight requests
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!("Cache server task failed: {}", e);
        }
    }
}

fn spawn_periodic_gc(
    service: Arc<CacheService>,
    period: std::time::Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // the first tick completes immediately and startup already swept
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(report) = service.gc().await {
                        tracing::debug!("Periodic sweep removed {:?}", report);
                    }
                }
            }
        }
    });
}

/// Local address of the interface that routes to the public internet
///
/// Connecting a UDP socket sends no packets; it only selects a route.
fn outbound_ip() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(("8.8.8.8", 80))?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_serves_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::new(dir.path().join("actcache"))
            .with_host(Some("127.0.0.1".to_string()));

        let server = CacheServer::start(config).await.unwrap();
        let port = server.local_addr().port();
        assert_ne!(port, 0);
        assert_eq!(server.external_url(), format!("http://127.0.0.1:{}", port));
        assert!(dir.path().join("actcache/sqlite.db").exists());
        assert!(dir.path().join("actcache/cache").is_dir());

        let stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await;
        assert!(stream.is_ok());
        drop(stream);

        server.shutdown().await;
    }
}
