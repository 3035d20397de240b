//! pbtc-recorder: per-instance message filtering and record fan-out.
//!
//! A recorder holds three filter sets (command, base58 address, remote IP)
//! evaluated with AND semantics, where an empty category always passes,
//! plus an ordered list of writers. Matching messages become typed
//! [`Record`]s and
//! are pushed to every writer in arrival order; slow writers back-pressure
//! the delivering peer.

pub mod record;

pub use record::{AddrEntry, InvEntry, Record, RecordHeader, TxOutEntry};

use async_trait::async_trait;
use bitcoin::network::message::NetworkMessage;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Writer seam
// ---------------------------------------------------------------------------

/// Record sink. Implementations own a bounded ingest queue; both methods
/// await queue space, which is what back-pressures the pipeline.
#[async_trait]
pub trait Writer: Send + Sync {
    /// Ingest one text record (without trailing newline).
    async fn line(&self, line: String);
    /// Ingest one binary record.
    async fn bytes(&self, payload: Vec<u8>);
}

/// Output representation a recorder pushes to its writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordFormat {
    #[default]
    Text,
    Binary,
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Filter and formatting settings for one recorder instance.
#[derive(Debug, Clone, Default)]
pub struct RecorderOptions {
    /// Wire commands to accept; empty accepts all.
    pub commands: Vec<String>,
    /// Base58 addresses matched against `tx` outputs; empty accepts all.
    pub addresses: Vec<String>,
    /// Remote IPs to accept; empty accepts all.
    pub ips: Vec<IpAddr>,
    pub format: RecordFormat,
}

pub struct Recorder {
    commands: HashSet<String>,
    addresses: HashSet<String>,
    ips: HashSet<IpAddr>,
    format: RecordFormat,
    network: bitcoin::Network,
    writers: Vec<Arc<dyn Writer>>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("commands", &self.commands)
            .field("addresses", &self.addresses)
            .field("ips", &self.ips)
            .field("format", &self.format)
            .field("writers", &self.writers.len())
            .finish()
    }
}

impl Recorder {
    pub fn new(
        options: RecorderOptions,
        network: bitcoin::Network,
        writers: Vec<Arc<dyn Writer>>,
    ) -> Self {
        Self {
            commands: options.commands.into_iter().collect(),
            addresses: options.addresses.into_iter().collect(),
            ips: options.ips.into_iter().collect(),
            format: options.format,
            network,
            writers,
        }
    }

    /// Deliver one decoded message. Filters first, then formats once and
    /// pushes the result to every writer in order.
    pub async fn record(&self, msg: &NetworkMessage, remote: SocketAddr, local: SocketAddr) {
        if !self.commands.is_empty() && !self.commands.contains(&msg.command().to_string()) {
            return;
        }
        if !self.ips.is_empty() && !self.ips.contains(&remote.ip()) {
            return;
        }

        let record = Record::from_message(msg, remote, local, self.network);

        // A non-empty address filter can only ever match tx outputs.
        if !self.addresses.is_empty()
            && !record.tx_addresses().any(|a| self.addresses.contains(a))
        {
            return;
        }

        pbtc_metrics::metrics().records_written.inc();

        match self.format {
            RecordFormat::Text => {
                let line = record.to_line();
                for writer in &self.writers {
                    writer.line(line.clone()).await;
                }
            }
            RecordFormat::Binary => {
                let payload = record.to_bytes();
                for writer in &self.writers {
                    writer.bytes(payload.clone()).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
