//! The repository's record of a known peer address.

use chrono::{DateTime, Utc};
use pbtc_common::addr_key;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// A known-of peer address, independent of whether it is currently
/// connected.
///
/// The three timestamps stay `None` until their first event: `last_connect`
/// marks any established TCP connect, `last_success` a completed handshake.
/// Neither implies the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Remote TCP address.
    pub addr: SocketAddr,
    /// Address that told us about this node; the zero address for DNS
    /// seeds and restored entries.
    pub src: SocketAddr,
    /// Outbound dial attempts since the last successful handshake.
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_connect: Option<DateTime<Utc>>,
}

impl Node {
    pub fn new(addr: SocketAddr, src: SocketAddr) -> Self {
        Self {
            addr,
            src,
            attempts: 0,
            last_attempt: None,
            last_success: None,
            last_connect: None,
        }
    }

    /// Canonical index key.
    pub fn key(&self) -> String {
        addr_key(&self.addr)
    }
}
