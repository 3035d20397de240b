//! Metrics and tracing setup for the pbtc crawler.
//!
//! Provides a global [`CrawlerMetrics`] singleton backed by the
//! `prometheus` crate, plus an optional lightweight HTTP server for
//! Prometheus scraping.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
///
/// Returns `false` when a subscriber was already installed.
pub fn init_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .is_ok()
}

// ────────────────────────── Prometheus metrics ──────────────────────────

/// Global metrics instance.
static METRICS: OnceLock<CrawlerMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static CrawlerMetrics {
    METRICS.get_or_init(CrawlerMetrics::new)
}

/// All Prometheus metrics for a crawler instance.
pub struct CrawlerMetrics {
    pub registry: Registry,

    // ── Dialing ──
    pub dial_attempts: IntCounter,
    pub handshakes_completed: IntCounter,

    // ── Peer population ──
    pub connected_peers: IntGauge,
    pub known_nodes: IntGauge,

    // ── Traffic ──
    pub messages_received: IntCounter,
    pub messages_by_command: IntCounterVec,
    pub records_written: IntCounter,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for CrawlerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrawlerMetrics").finish_non_exhaustive()
    }
}

impl CrawlerMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let dial_attempts = IntCounter::with_opts(Opts::new(
            "pbtc_dial_attempts_total",
            "Outbound connection attempts",
        ))
        .expect("dial_attempts counter");
        let handshakes_completed = IntCounter::with_opts(Opts::new(
            "pbtc_handshakes_completed_total",
            "Completed version/verack handshakes",
        ))
        .expect("handshakes_completed counter");

        let connected_peers = IntGauge::with_opts(Opts::new(
            "pbtc_connected_peers",
            "Peers currently tracked by the manager",
        ))
        .expect("connected_peers gauge");
        let known_nodes = IntGauge::with_opts(Opts::new(
            "pbtc_known_nodes",
            "Addresses in the node repository",
        ))
        .expect("known_nodes gauge");

        let messages_received = IntCounter::with_opts(Opts::new(
            "pbtc_messages_received_total",
            "Messages received from peers",
        ))
        .expect("messages_received counter");
        let messages_by_command = IntCounterVec::new(
            Opts::new(
                "pbtc_messages_by_command_total",
                "Messages received, by wire command",
            ),
            &["command"],
        )
        .expect("messages_by_command counter vec");
        let records_written = IntCounter::with_opts(Opts::new(
            "pbtc_records_written_total",
            "Records pushed to writers",
        ))
        .expect("records_written counter");

        registry
            .register(Box::new(dial_attempts.clone()))
            .expect("register dial_attempts");
        registry
            .register(Box::new(handshakes_completed.clone()))
            .expect("register handshakes_completed");
        registry
            .register(Box::new(connected_peers.clone()))
            .expect("register connected_peers");
        registry
            .register(Box::new(known_nodes.clone()))
            .expect("register known_nodes");
        registry
            .register(Box::new(messages_received.clone()))
            .expect("register messages_received");
        registry
            .register(Box::new(messages_by_command.clone()))
            .expect("register messages_by_command");
        registry
            .register(Box::new(records_written.clone()))
            .expect("register records_written");

        Self {
            registry,
            dial_attempts,
            handshakes_completed,
            connected_peers,
            known_nodes,
            messages_received,
            messages_by_command,
            records_written,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    _req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let body = encode_metrics();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .expect("valid HTTP response"))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// This spawns a lightweight HTTP/1.1 server. Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────
