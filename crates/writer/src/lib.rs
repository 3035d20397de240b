//! pbtc-writer: record sinks.
//!
//! Provides:
//! - [`FileWriter`]: rotated, optionally compressed log files
//! - [`ZmqWriter`]: ZeroMQ PUB socket publication
//! - [`Compressor`]: the compression seam used on rotation
//!
//! Both writers ingest through a bounded queue of capacity 1; a slow sink
//! back-pressures the recorders and, through them, the peers.

pub mod compress;
pub mod file;
pub mod zmq_pub;

pub use compress::{Compressor, Lz4Compressor};
pub use file::{FileWriter, FileWriterOptions, VERSION_HEADER};
pub use zmq_pub::ZmqWriter;

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("writer I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zmq error: {0}")]
    Zmq(#[from] zmq::Error),
}
