//! pbtc-common: shared types for the pbtc crawler.
//!
//! Provides the [`Chain`] selector (network magic and default port), the
//! canonical address key used by the repository and manager indexes, the
//! one-byte command codes used by binary records, and local interface
//! enumeration for the inbound listeners.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// The Bitcoin network a crawler instance participates in.
///
/// Carries the 4-byte wire magic and the well-known TCP port. `Simnet` is a
/// btcd-only network, so it keeps its own magic value rather than going
/// through [`bitcoin::Network`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Mainnet,
    Testnet3,
    Testnet,
    Simnet,
}

impl Chain {
    /// Wire magic, little-endian as it appears in the frame header.
    pub fn magic(self) -> u32 {
        match self {
            Chain::Mainnet => 0xD9B4_BEF9,
            Chain::Testnet3 => 0x0709_110B,
            Chain::Testnet => 0xDAB5_BFFA,
            Chain::Simnet => 0x1214_1C16,
        }
    }

    /// Default peer-to-peer TCP port.
    pub fn default_port(self) -> u16 {
        match self {
            Chain::Mainnet => 8333,
            Chain::Testnet3 => 18333,
            Chain::Testnet => 18444,
            Chain::Simnet => 18555,
        }
    }

    /// The closest [`bitcoin::Network`] for address encoding purposes.
    ///
    /// Simnet shares testnet's base58 prefixes.
    pub fn btc_network(self) -> bitcoin::Network {
        match self {
            Chain::Mainnet => bitcoin::Network::Bitcoin,
            Chain::Testnet3 => bitcoin::Network::Testnet,
            Chain::Testnet => bitcoin::Network::Regtest,
            Chain::Simnet => bitcoin::Network::Testnet,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Chain::Mainnet => "mainnet",
            Chain::Testnet3 => "testnet3",
            Chain::Testnet => "testnet",
            Chain::Simnet => "simnet",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" => Ok(Chain::Mainnet),
            "testnet3" => Ok(Chain::Testnet3),
            "testnet" => Ok(Chain::Testnet),
            "simnet" => Ok(Chain::Simnet),
            other => Err(format!("unknown chain: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Address keys
// ---------------------------------------------------------------------------

/// Canonical `host:port` key for an address.
///
/// Both the repository's node index and the manager's peer index are keyed
/// by this string, so an address can appear in each at most once.
pub fn addr_key(addr: &SocketAddr) -> String {
    addr.to_string()
}

/// The zero address recorded as the source of self-discovered nodes
/// (DNS seeds, restored entries), matching the family of `addr`.
pub fn zero_src(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

// ---------------------------------------------------------------------------
// Command codes
// ---------------------------------------------------------------------------

/// One-byte code identifying a message kind in binary records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandCode {
    Other = 0,
    Version = 1,
    Verack = 2,
    Addr = 3,
    Inv = 4,
    GetAddr = 5,
    Ping = 6,
    Pong = 7,
    Tx = 8,
}

impl CommandCode {
    /// Map a wire command string to its code. Unknown commands map to
    /// [`CommandCode::Other`].
    pub fn from_command(cmd: &str) -> Self {
        match cmd {
            "version" => CommandCode::Version,
            "verack" => CommandCode::Verack,
            "addr" => CommandCode::Addr,
            "inv" => CommandCode::Inv,
            "getaddr" => CommandCode::GetAddr,
            "ping" => CommandCode::Ping,
            "pong" => CommandCode::Pong,
            "tx" => CommandCode::Tx,
            _ => CommandCode::Other,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ---------------------------------------------------------------------------
// Local interfaces
// ---------------------------------------------------------------------------

/// Enumerate the IPv4 addresses of local non-loopback interfaces.
///
/// Inbound listening is IPv4-only; IPv6 interfaces are skipped. Enumeration
/// failure yields an empty list, leaving the crawler outbound-only.
pub fn find_local_ipv4s() -> Vec<Ipv4Addr> {
    let ifas = match local_ip_address::list_afinet_netifas() {
        Ok(ifas) => ifas,
        Err(e) => {
            tracing::warn!("could not enumerate local interfaces: {}", e);
            return Vec::new();
        }
    };

    ifas.into_iter()
        .filter_map(|(_name, ip)| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_ports_and_magic() {
        assert_eq!(Chain::Mainnet.default_port(), 8333);
        assert_eq!(Chain::Testnet3.default_port(), 18333);
        assert_eq!(Chain::Testnet.default_port(), 18444);
        assert_eq!(Chain::Simnet.default_port(), 18555);

        assert_eq!(Chain::Mainnet.magic(), 0xD9B4BEF9);
        assert_eq!(Chain::Mainnet.magic(), bitcoin::Network::Bitcoin.magic());
        assert_eq!(Chain::Testnet3.magic(), bitcoin::Network::Testnet.magic());
    }

    #[test]
    fn test_chain_from_str() {
        assert_eq!("mainnet".parse::<Chain>().unwrap(), Chain::Mainnet);
        assert_eq!("TESTNET3".parse::<Chain>().unwrap(), Chain::Testnet3);
        assert!("bogus".parse::<Chain>().is_err());
    }

    #[test]
    fn test_addr_key_roundtrip() {
        let addr: SocketAddr = "1.2.3.4:8333".parse().unwrap();
        assert_eq!(addr_key(&addr), "1.2.3.4:8333");
        assert_eq!(addr_key(&addr).parse::<SocketAddr>().unwrap(), addr);
    }

    #[test]
    fn test_zero_src_matches_family() {
        let v4: SocketAddr = "1.2.3.4:8333".parse().unwrap();
        assert_eq!(zero_src(&v4), "0.0.0.0:0".parse::<SocketAddr>().unwrap());

        let v6: SocketAddr = "[2001:db8::1]:8333".parse().unwrap();
        assert_eq!(zero_src(&v6), "[::]:0".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_command_codes() {
        assert_eq!(CommandCode::from_command("addr"), CommandCode::Addr);
        assert_eq!(CommandCode::from_command("tx"), CommandCode::Tx);
        assert_eq!(CommandCode::from_command("headers"), CommandCode::Other);
        assert_eq!(CommandCode::Addr.as_u8(), 3);
    }
}
