//! Galleria Library
//!
//! Event photo and video galleries: guests upload into a named event, and the
//! whole gallery can later be downloaded as one streamed zip archive.
//!
//! # Features
//!
//! - **Transactional Uploads**: a batch lands in blob storage and event
//!   metadata together, or not at all
//! - **Streaming Archives**: galleries are zipped on the fly, one file in memory at a time
//! - **Lost-Update Free Metadata**: versioned compare-and-swap on every event write
//! - **Pluggable Storage**: filesystem, in-memory or any S3-compatible service
//!
//! # Example
//!
//! ```no_run
//! use galleria::{config::Config, server::{AppState, Server}};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let state = Arc::new(AppState::from_config(&config).await?);
//!     let server = Server::bind(&config.server.address, state).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod blob;
pub mod config;
pub mod error;
pub mod events;
pub mod metadata;
pub mod metrics;
pub mod reconcile;
pub mod router;
pub mod s3;
pub mod server;
pub mod telemetry;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use error::GalleryError;
pub use server::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
