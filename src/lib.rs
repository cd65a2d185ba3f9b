//! Tus Uploadr Library
//!
//! Resumable upload server implementing the TUS 1.0.0 protocol.
//!
//! # Features
//!
//! - **Resumable**: Clients pause and resume from any committed offset
//! - **Offset Verified**: Stale or racing chunks are rejected with `409 Conflict`
//! - **Crash Safe**: Metadata side-cars are replaced atomically
//! - **Completion Hook**: The embedding application decides where finished files go
//! - **Extensions**: creation, creation-defer-length, creation-with-upload,
//!   termination, expiration
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tus_uploadr::{config::Config, server::Server, upload::CopyToDirectoryHook};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let hook = Arc::new(CopyToDirectoryHook::new(&config.completion.target_dir));
//!     let server = Server::new(config, hook).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod metrics;
pub mod protocol;
pub mod router;
pub mod server;
pub mod store;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use server::Server;
pub use upload::{CompletionHook, SessionManager, UploadError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
