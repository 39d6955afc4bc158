//! Low-latency video ingest and fan-out relay
//!
//! Framelink sits between a single camera-side producer and many
//! browser-style subscribers. The producer pushes encoded frames over a
//! chunked-UDP or framed-TCP transport; the server reassembles frames,
//! restores their order, optionally transcodes them and runs them through
//! an out-of-process inference worker, and republishes them to every
//! subscriber over SSE, multipart-JPEG, or WebSocket.
//!
//! The pipeline is lossy on purpose: late, incomplete, or stale frames are
//! dropped rather than retried into unbounded delay.
//!
//! # Example
//!
//! ```no_run
//! use framelink::config::Config;
//! use framelink::session::Session;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load("config.toml")?;
//! let session = Session::new(config)?;
//! session.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod hub;
pub mod inference;
pub mod producer;
pub mod protocol;
pub mod sender;
pub mod session;
pub mod shm;
pub mod web;
pub mod wire;

// Re-exports for convenience
pub use config::{Config, Format, Transport};
pub use hub::{FanoutHub, Subscriber};
pub use session::{Session, Variant};
