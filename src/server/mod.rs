//! HTTP server module
//!
//! Accepts connections and serves the TUS protocol handler over HTTP/1.1.
//!
//! # Architecture
//!
//! The server is built on top of `hyper` and `tokio`:
//! - One task per connection
//! - Per-upload serialization lives in the session manager, not here
//! - Background sweeper for expired uploads
//! - Graceful shutdown on Ctrl-C
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tus_uploadr::config::Config;
//! use tus_uploadr::server::Server;
//! use tus_uploadr::upload::CopyToDirectoryHook;
//!
//! # async fn example(config: Config) -> Result<(), Box<dyn std::error::Error>> {
//! let hook = Arc::new(CopyToDirectoryHook::new(&config.completion.target_dir));
//! let server = Server::new(config, hook).await?;
//! println!("Listening on {}", server.local_addr());
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod handler;

pub use handler::{handle_request, AppState};

use crate::config::Config;
use crate::store::FileMetadataStore;
use crate::upload::{CompletionHook, SessionManager};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(String),

    #[error("Storage setup failed: {0}")]
    StorageError(String),

    #[error("Server error: {0}")]
    RuntimeError(String),
}

/// HTTP Server
///
/// # Fields
///
/// * `listener` - TCP listener for accepting connections
/// * `local_addr` - The actual address the server is bound to
/// * `state` - Handler state shared across connections
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<AppState>,
    sweep_interval: Option<Duration>,
}

impl Server {
    /// Create the upload engine and bind to the configured address.
    ///
    /// If port 0 is specified, the OS assigns an available port.
    pub async fn new(config: Config, hook: Arc<dyn CompletionHook>) -> Result<Self, ServerError> {
        let addr: SocketAddr = config
            .server
            .address
            .parse()
            .map_err(|e| ServerError::BindError(format!("Invalid address: {}", e)))?;

        tokio::fs::create_dir_all(&config.tus.storage_dir)
            .await
            .map_err(|e| {
                ServerError::StorageError(format!(
                    "Failed to create {}: {}",
                    config.tus.storage_dir.display(),
                    e
                ))
            })?;

        let store = Arc::new(FileMetadataStore::new(&config.tus.storage_dir));
        let sessions = Arc::new(SessionManager::new(&config.tus, store, hook));
        let state = Arc::new(AppState::new(&config, sessions));

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(format!("Failed to bind to {}: {}", addr, e)))?;

        // Get actual bound address (important for port 0)
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(format!("Failed to get local address: {}", e)))?;

        info!("Server bound to {}", local_addr);

        let sweep_interval = config
            .tus
            .expiry_secs
            .map(|_| Duration::from_secs(config.tus.sweep_interval_secs));

        Ok(Self {
            listener,
            local_addr,
            state,
            sweep_interval,
        })
    }

    /// Get the local address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The session manager behind this server
    pub fn sessions(&self) -> Arc<SessionManager> {
        Arc::clone(self.state.sessions())
    }

    /// Run the server until Ctrl-C
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run the server until `shutdown` resolves
    ///
    /// Each connection is handled in a separate tokio task. Accept errors are
    /// logged and do not stop the server.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        info!("Starting server on {}", self.local_addr);

        let sweeper = self.spawn_sweeper();
        tokio::pin!(shutdown);

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let state = Arc::clone(&self.state);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |req| handle_request(req, Arc::clone(&state)));

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    warn!("Error serving connection from {}: {}", peer_addr, e);
                }
            });
        }

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        info!("Shutting down server");
        Ok(())
    }

    fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        let period = self.sweep_interval?;
        let sessions = self.sessions();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = sessions.sweep_expired().await {
                    error!(error = %e, "Expiry sweep failed");
                }
            }
        }))
    }
}
