//! Decoded, timestamped observations of received messages.
//!
//! Each known message kind gets a typed variant; the formatters live on
//! the sum type. Text records are one line, space-delimited, with
//! multi-element payloads continuing on lines that begin with a single
//! space. The binary form is defined for `addr` records.

use bitcoin::network::message::NetworkMessage;
use chrono::{DateTime, SecondsFormat, Utc};
use pbtc_common::CommandCode;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Fields shared by every record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub stamp: DateTime<Utc>,
    pub command: String,
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

impl RecordHeader {
    fn new(command: String, remote: SocketAddr, local: SocketAddr) -> Self {
        Self {
            stamp: Utc::now(),
            command,
            remote,
            local,
        }
    }

    /// `<command> <RFC3339Nano> <remote> <local>`
    fn write_prefix(&self, out: &mut String) {
        let _ = write!(
            out,
            "{} {} {} {}",
            self.command,
            self.stamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.remote,
            self.local,
        );
    }
}

// ---------------------------------------------------------------------------
// Payload pieces
// ---------------------------------------------------------------------------

/// One gossiped address from an `addr` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrEntry {
    /// Last-seen time advertised by the gossiping peer (unix seconds).
    pub time: u32,
    pub services: u64,
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl AddrEntry {
    /// The socket address, collapsed back to IPv4 when v6-mapped.
    pub fn socket_addr(&self) -> SocketAddr {
        match self.ip.to_ipv4() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), self.port),
            None => SocketAddr::new(IpAddr::V6(self.ip), self.port),
        }
    }
}

/// One announced inventory item from an `inv` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvEntry {
    pub kind: &'static str,
    pub hash: String,
}

/// One output of a recorded transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutEntry {
    pub value: u64,
    /// Base58/bech32 form of the output script, when standard.
    pub address: Option<String>,
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A single observed message, ready for formatting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Version {
        header: RecordHeader,
        version: u32,
        services: u64,
        start_height: i32,
        nonce: u64,
        user_agent: String,
    },
    Verack {
        header: RecordHeader,
    },
    Addr {
        header: RecordHeader,
        entries: Vec<AddrEntry>,
    },
    Inv {
        header: RecordHeader,
        items: Vec<InvEntry>,
    },
    GetAddr {
        header: RecordHeader,
    },
    Ping {
        header: RecordHeader,
        nonce: u64,
    },
    Pong {
        header: RecordHeader,
        nonce: u64,
    },
    Tx {
        header: RecordHeader,
        txid: String,
        inputs: usize,
        outputs: Vec<TxOutEntry>,
    },
    Other {
        header: RecordHeader,
    },
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

impl Record {
    /// Build a record from a decoded message.
    ///
    /// `network` selects the address encoding used for transaction outputs.
    pub fn from_message(
        msg: &NetworkMessage,
        remote: SocketAddr,
        local: SocketAddr,
        network: bitcoin::Network,
    ) -> Self {
        let header = RecordHeader::new(msg.command().to_string(), remote, local);

        match msg {
            NetworkMessage::Version(v) => Record::Version {
                header,
                version: v.version,
                services: v.services.as_u64(),
                start_height: v.start_height,
                nonce: v.nonce,
                user_agent: v.user_agent.clone(),
            },
            NetworkMessage::Verack => Record::Verack { header },
            NetworkMessage::Addr(list) => Record::Addr {
                header,
                entries: list
                    .iter()
                    .map(|(time, addr)| AddrEntry {
                        time: *time,
                        services: addr.services.as_u64(),
                        ip: Ipv6Addr::new(
                            addr.address[0],
                            addr.address[1],
                            addr.address[2],
                            addr.address[3],
                            addr.address[4],
                            addr.address[5],
                            addr.address[6],
                            addr.address[7],
                        ),
                        port: addr.port,
                    })
                    .collect(),
            },
            NetworkMessage::Inv(items) => Record::Inv {
                header,
                items: items.iter().map(inv_entry).collect(),
            },
            NetworkMessage::GetAddr => Record::GetAddr { header },
            NetworkMessage::Ping(nonce) => Record::Ping {
                header,
                nonce: *nonce,
            },
            NetworkMessage::Pong(nonce) => Record::Pong {
                header,
                nonce: *nonce,
            },
            NetworkMessage::Tx(tx) => Record::Tx {
                header,
                txid: tx.txid().to_string(),
                inputs: tx.input.len(),
                outputs: tx
                    .output
                    .iter()
                    .map(|out| TxOutEntry {
                        value: out.value,
                        address: bitcoin::Address::from_script(&out.script_pubkey, network)
                            .ok()
                            .map(|a| a.to_string()),
                    })
                    .collect(),
            },
            _ => Record::Other { header },
        }
    }

    pub fn header(&self) -> &RecordHeader {
        match self {
            Record::Version { header, .. }
            | Record::Verack { header }
            | Record::Addr { header, .. }
            | Record::Inv { header, .. }
            | Record::GetAddr { header }
            | Record::Ping { header, .. }
            | Record::Pong { header, .. }
            | Record::Tx { header, .. }
            | Record::Other { header } => header,
        }
    }

    pub fn command(&self) -> &str {
        &self.header().command
    }

    /// Output addresses of a recorded transaction; empty for anything else.
    pub fn tx_addresses(&self) -> impl Iterator<Item = &str> + '_ {
        let outputs = match self {
            Record::Tx { outputs, .. } => Some(outputs),
            _ => None,
        };
        outputs
            .into_iter()
            .flatten()
            .filter_map(|o| o.address.as_deref())
    }

    // -----------------------------------------------------------------------
    // Text form
    // -----------------------------------------------------------------------

    /// The record as one (possibly continued) text line, without the
    /// trailing newline.
    pub fn to_line(&self) -> String {
        let mut out = String::new();
        self.header().write_prefix(&mut out);

        match self {
            Record::Version {
                version,
                services,
                start_height,
                nonce,
                user_agent,
                ..
            } => {
                let _ = write!(
                    out,
                    " {} {} {} {} {}",
                    version, services, start_height, nonce, user_agent
                );
            }
            Record::Verack { .. } | Record::GetAddr { .. } | Record::Other { .. } => {}
            Record::Addr { entries, .. } => {
                let _ = write!(out, " {}", entries.len());
                for entry in entries {
                    let _ = write!(
                        out,
                        "\n {} {} {}",
                        entry.time,
                        entry.services,
                        entry.socket_addr()
                    );
                }
            }
            Record::Inv { items, .. } => {
                let _ = write!(out, " {}", items.len());
                for item in items {
                    let _ = write!(out, "\n {} {}", item.kind, item.hash);
                }
            }
            Record::Ping { nonce, .. } | Record::Pong { nonce, .. } => {
                let _ = write!(out, " {}", nonce);
            }
            Record::Tx {
                txid,
                inputs,
                outputs,
                ..
            } => {
                let _ = write!(out, " {} {} {}", txid, inputs, outputs.len());
                for output in outputs {
                    let _ = write!(
                        out,
                        "\n {} {}",
                        output.value,
                        output.address.as_deref().unwrap_or("nonstandard")
                    );
                }
            }
        }

        out
    }

    // -----------------------------------------------------------------------
    // Binary form
    // -----------------------------------------------------------------------

    /// The record as a binary frame.
    ///
    /// `addr` records use the fixed layout: 47-byte little-endian header
    /// (timestamp ns, v6-mapped endpoints, command code, entry count)
    /// followed by 30 bytes per entry with the port big-endian as on the
    /// wire. Every other kind falls back to its text form's bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let entries = match self {
            Record::Addr { entries, .. } => entries,
            _ => return self.to_line().into_bytes(),
        };

        let header = self.header();
        let mut buf = Vec::with_capacity(47 + 30 * entries.len());

        let nanos = header.stamp.timestamp_nanos_opt().unwrap_or_default();
        buf.extend_from_slice(&nanos.to_le_bytes());
        push_endpoint(&mut buf, &header.remote);
        push_endpoint(&mut buf, &header.local);
        buf.push(CommandCode::from_command(&header.command).as_u8());
        buf.extend_from_slice(&(entries.len() as u16).to_le_bytes());

        for entry in entries {
            buf.extend_from_slice(&entry.time.to_le_bytes());
            buf.extend_from_slice(&entry.services.to_le_bytes());
            buf.extend_from_slice(&entry.ip.octets());
            buf.extend_from_slice(&entry.port.to_be_bytes());
        }

        buf
    }
}

/// 16-byte v6-mapped IP followed by a little-endian port.
fn push_endpoint(buf: &mut Vec<u8>, addr: &SocketAddr) {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    buf.extend_from_slice(&ip.octets());
    buf.extend_from_slice(&addr.port().to_le_bytes());
}

fn inv_entry(inv: &bitcoin::network::message_blockdata::Inventory) -> InvEntry {
    use bitcoin::network::message_blockdata::Inventory;

    match inv {
        Inventory::Error => InvEntry {
            kind: "error",
            hash: String::new(),
        },
        Inventory::Transaction(txid) => InvEntry {
            kind: "tx",
            hash: txid.to_string(),
        },
        Inventory::Block(hash) => InvEntry {
            kind: "block",
            hash: hash.to_string(),
        },
        Inventory::WTx(wtxid) => InvEntry {
            kind: "wtx",
            hash: wtxid.to_string(),
        },
        Inventory::WitnessTransaction(txid) => InvEntry {
            kind: "witness-tx",
            hash: txid.to_string(),
        },
        Inventory::WitnessBlock(hash) => InvEntry {
            kind: "witness-block",
            hash: hash.to_string(),
        },
        Inventory::CompactBlock(hash) => InvEntry {
            kind: "compact-block",
            hash: hash.to_string(),
        },
        Inventory::Unknown { inv_type, hash } => InvEntry {
            kind: "unknown",
            hash: format!("{}:{}", inv_type, hex(hash)),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::network::address::Address;
    use bitcoin::network::constants::ServiceFlags;

    fn endpoints() -> (SocketAddr, SocketAddr) {
        (
            "93.184.216.34:8333".parse().unwrap(),
            "10.0.0.5:51234".parse().unwrap(),
        )
    }

    fn addr_message(n: usize) -> NetworkMessage {
        let list = (0..n)
            .map(|i| {
                let sock: SocketAddr = format!("192.0.2.{}:8333", i + 1).parse().unwrap();
                (1_700_000_000 + i as u32, Address::new(&sock, ServiceFlags::NETWORK))
            })
            .collect();
        NetworkMessage::Addr(list)
    }

    #[test]
    fn test_text_line_field_order() {
        let (remote, local) = endpoints();
        let record = Record::from_message(
            &NetworkMessage::Ping(77),
            remote,
            local,
            bitcoin::Network::Bitcoin,
        );

        let line = record.to_line();
        let fields: Vec<&str> = line.split(' ').collect();
        assert_eq!(fields[0], "ping");
        // RFC3339 with nanosecond precision, UTC.
        assert!(fields[1].ends_with('Z'), "timestamp not UTC: {}", fields[1]);
        assert!(fields[1].contains('.'), "timestamp lacks subseconds");
        assert_eq!(fields[2], "93.184.216.34:8333");
        assert_eq!(fields[3], "10.0.0.5:51234");
        assert_eq!(fields[4], "77");
    }

    #[test]
    fn test_addr_text_continuation_lines() {
        let (remote, local) = endpoints();
        let record =
            Record::from_message(&addr_message(3), remote, local, bitcoin::Network::Bitcoin);

        let line = record.to_line();
        let mut lines = line.lines();
        let first = lines.next().unwrap();
        assert!(first.starts_with("addr "));
        assert!(first.ends_with(" 3"));
        for continuation in lines {
            assert!(continuation.starts_with(' '));
            assert!(continuation.contains(":8333"));
        }
        assert_eq!(line.lines().count(), 4);
    }

    #[test]
    fn test_addr_binary_length() {
        let (remote, local) = endpoints();
        for n in [0usize, 1, 5, 1000] {
            let record =
                Record::from_message(&addr_message(n), remote, local, bitcoin::Network::Bitcoin);
            let bytes = record.to_bytes();
            assert_eq!(bytes.len(), 47 + 30 * n, "length for {} entries", n);
        }
    }

    #[test]
    fn test_addr_binary_header_layout() {
        let (remote, local) = endpoints();
        let record =
            Record::from_message(&addr_message(2), remote, local, bitcoin::Network::Bitcoin);
        let bytes = record.to_bytes();

        // Remote IP is v6-mapped at offset 8.
        let mapped: [u8; 16] = bytes[8..24].try_into().unwrap();
        assert_eq!(
            Ipv6Addr::from(mapped),
            "93.184.216.34".parse::<std::net::Ipv4Addr>().unwrap().to_ipv6_mapped()
        );
        // Remote port, little-endian, at offset 24.
        assert_eq!(u16::from_le_bytes([bytes[24], bytes[25]]), 8333);
        // Command code at offset 44, entry count at 45.
        assert_eq!(bytes[44], CommandCode::Addr.as_u8());
        assert_eq!(u16::from_le_bytes([bytes[45], bytes[46]]), 2);
    }

    #[test]
    fn test_verack_is_header_only() {
        let (remote, local) = endpoints();
        let record = Record::from_message(
            &NetworkMessage::Verack,
            remote,
            local,
            bitcoin::Network::Bitcoin,
        );
        let line = record.to_line();
        assert_eq!(line.split(' ').count(), 4);
        assert!(line.starts_with("verack "));
    }

    #[test]
    fn test_addr_entry_collapses_v4_mapped() {
        let entry = AddrEntry {
            time: 0,
            services: 0,
            ip: "192.0.2.9".parse::<std::net::Ipv4Addr>().unwrap().to_ipv6_mapped(),
            port: 8333,
        };
        assert_eq!(entry.socket_addr().to_string(), "192.0.2.9:8333");
    }
}
