//! MP3/ICY format handling: mount ingest, metadata and listener framing.

pub mod flv;
pub mod headers;
pub mod icy;
pub mod ingest;
pub mod mpeg;
pub mod sender;

pub use headers::{ListenerRequest, response_headers};
pub use icy::MetaBuilder;
pub use ingest::{MountIngest, StreamReader};
pub use mpeg::MpegSync;
pub use sender::{ClientChannel, Framing, ListenerSender};

/// Errors raised while ingesting or re-framing a stream.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// An inline ICY metadata block failed validation.
    #[error("bad inline metadata block on {mount}: {reason}")]
    BadMetadataBlock {
        /// Mount the block arrived on.
        mount: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A composed metadata update exceeded the ICY wire limit.
    #[error("metadata too long at {len} chars")]
    MetadataTooLong {
        /// Length the update would have needed.
        len: usize,
    },

    /// The frame parser lost sync and could not recover.
    #[error("no frames detected for {mount}")]
    Unsynchronised {
        /// Mount or peer label the parser was attached to.
        mount: String,
    },

    /// More unparsed trailing bytes than the configured ceiling.
    #[error("{count} unparsed bytes on {mount}, probably not audio")]
    ExcessUnparsed {
        /// Mount the stream arrived on.
        mount: String,
        /// Trailing byte count observed.
        count: usize,
    },

    /// The upstream connection failed mid-read.
    #[error("upstream read failed")]
    Io(#[from] std::io::Error),
}
