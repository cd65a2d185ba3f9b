//! Shared integration test infrastructure
//!
//! Starts a real server on an OS-assigned port with temporary storage and
//! public directories, and offers small TUS client helpers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;
use tus_uploadr::config::{CompletionConfig, Config, MetricsConfig, ServerConfig, TusConfig};
use tus_uploadr::server::Server;
use tus_uploadr::upload::{CompletionHook, CopyToDirectoryHook};
use tus_uploadr::SessionManager;

pub const TUS_VERSION: &str = "1.0.0";

/// A running server plus the directories it writes to
pub struct TestServer {
    pub addr: SocketAddr,
    pub client: reqwest::Client,
    pub storage_dir: PathBuf,
    pub public_dir: PathBuf,
    pub sessions: Arc<SessionManager>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    /// Start a server whose hook copies finished uploads into `public_dir`
    pub async fn start(storage_dir: &Path, public_dir: &Path) -> Self {
        let hook = Arc::new(CopyToDirectoryHook::new(public_dir));
        Self::start_with(test_config(storage_dir), public_dir, hook).await
    }

    pub async fn start_with(
        config: Config,
        public_dir: &Path,
        hook: Arc<dyn CompletionHook>,
    ) -> Self {
        let storage_dir = config.tus.storage_dir.clone();
        let server = Server::new(config, hook).await.expect("Failed to create server");
        let addr = server.local_addr();
        let sessions = server.sessions();

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = server
                .run_until(async {
                    let _ = rx.await;
                })
                .await;
        });

        Self {
            addr,
            client: reqwest::Client::new(),
            storage_dir,
            public_dir: public_dir.to_path_buf(),
            sessions,
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }

    /// Stop accepting connections and wait for the accept loop to exit
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// POST a new upload and return its `Location`
    pub async fn create(&self, length: u64, metadata: Option<&str>) -> String {
        let mut request = self
            .client
            .post(self.url("/files"))
            .header("Tus-Resumable", TUS_VERSION)
            .header("Upload-Length", length.to_string());
        if let Some(metadata) = metadata {
            request = request.header("Upload-Metadata", metadata);
        }

        let response = request.send().await.expect("create request failed");
        assert_eq!(response.status(), 201);
        response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .expect("Location header missing")
            .to_string()
    }

    /// PATCH a chunk at `offset`
    pub async fn patch(&self, location: &str, offset: u64, data: &[u8]) -> reqwest::Response {
        self.client
            .patch(self.url(location))
            .header("Tus-Resumable", TUS_VERSION)
            .header("Upload-Offset", offset.to_string())
            .header("Content-Type", "application/offset+octet-stream")
            .body(data.to_vec())
            .send()
            .await
            .expect("patch request failed")
    }

    pub async fn head(&self, location: &str) -> reqwest::Response {
        self.client
            .head(self.url(location))
            .header("Tus-Resumable", TUS_VERSION)
            .send()
            .await
            .expect("head request failed")
    }

    pub async fn delete(&self, location: &str) -> reqwest::Response {
        self.client
            .delete(self.url(location))
            .header("Tus-Resumable", TUS_VERSION)
            .send()
            .await
            .expect("delete request failed")
    }
}

pub fn test_config(storage_dir: &Path) -> Config {
    Config {
        server: ServerConfig {
            address: "127.0.0.1:0".into(),
            cors: true,
        },
        tus: TusConfig {
            storage_dir: storage_dir.to_path_buf(),
            ..TusConfig::default()
        },
        completion: CompletionConfig::default(),
        metrics: MetricsConfig::default(),
    }
}

pub fn header<'a>(response: &'a reqwest::Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Random bytes for payloads
pub fn random_payload(size: usize) -> Vec<u8> {
    use rand::Rng;
    let mut rng = rand::rng();
    (0..size).map(|_| rng.random()).collect()
}
