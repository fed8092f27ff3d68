//! Aircast Core - live audio broadcasting and relaying

#![deny(missing_docs)]
#![deny(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]
//!
//! This crate provides the hard middle of an Icecast-family streaming
//! server: the MP3/ICY format pipeline that ingests framed audio,
//! strips and rebroadcasts inline metadata and fans blocks out to
//! listeners in three wire framings, and the relay subsystem that pulls
//! streams from master peers, diffs configured relay sets and drives
//! each relay through its lifecycle on a cooperative scheduler.

pub mod buffer;
pub mod config;
pub mod format;
pub mod relay;
pub mod source;
pub mod stats;
pub mod tracing_setup;
pub mod worker;

// Re-export main types for convenient access
pub use buffer::{BlockQueue, MetaUpdate, StreamBlock};
pub use config::AircastConfig;
pub use format::{FormatError, Framing, ListenerSender, MountIngest, MpegSync};
pub use relay::{MasterPoller, Relay, RelayEngine, RelayError};
pub use source::{MountRegistry, Source};
pub use tracing_setup::{CliLogLevel, init_tracing};
pub use worker::WorkerPool;

/// Errors that can bubble up from any Aircast subsystem.
#[derive(Debug, thiserror::Error)]
pub enum AircastError {
    /// Stream ingest or listener framing failures.
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// Relay, master poll or redirect failures.
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using AircastError as the error type.
pub type Result<T> = std::result::Result<T, AircastError>;
