//! DNS seed resolution behind a trait, so bootstrap is testable
//! without touching the network.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;

/// Resolves a seed hostname into peer addresses at the given port.
#[async_trait]
pub trait SeedResolver: Send + Sync + 'static {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// System resolver via `tokio::net::lookup_host`.
#[derive(Debug, Default)]
pub struct DnsResolver;

#[async_trait]
impl SeedResolver for DnsResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.collect())
    }
}
