//! pbtc-repo: the node repository.
//!
//! Owns the set of known peer addresses, scores and dispenses them for
//! dialing, and persists them to disk. Mutations funnel through either the
//! index lock or the bounded intake queue drained by a single handler task;
//! the intake queue is the one place in the pipeline where overflow drops
//! (addresses can always be re-learned).

pub mod node;
pub mod resolve;
pub mod select;
pub mod store;

pub use node::Node;
pub use resolve::{DnsResolver, SeedResolver};

use async_trait::async_trait;
use chrono::Utc;
use pbtc_common::{addr_key, zero_src};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;

// ---------------------------------------------------------------------------
// Errors and the AddressBook seam
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("no nodes in repository")]
    NoNodes,
    #[error("repository I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("node file encoding error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// The address-book contract the connection manager dials against.
///
/// Implemented by [`Repository`]; tests substitute mocks.
#[async_trait]
pub trait AddressBook: Send + Sync + 'static {
    /// Register `addr` if unknown; refresh its source otherwise.
    async fn update(&self, addr: SocketAddr, src: SocketAddr);
    /// Count an outbound dial attempt against `addr`.
    async fn attempt(&self, addr: SocketAddr);
    /// Mark an established TCP connect to `addr`.
    async fn connected(&self, addr: SocketAddr);
    /// Mark a completed handshake with `addr`; resets the attempt counter.
    async fn good(&self, addr: SocketAddr);
    /// One address suitable to dial.
    async fn get(&self) -> Result<SocketAddr, RepoError>;
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Runtime settings for a [`Repository`].
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// DNS seed hostnames resolved during bootstrap.
    pub seeds: Vec<String>,
    /// Port combined with resolved seed IPs.
    pub default_port: u16,
    /// Hard cap on the node index; inserts past it are dropped.
    pub node_limit: usize,
    /// Where the index is persisted.
    pub backup_path: PathBuf,
    /// Period of the background save task.
    pub backup_rate: Duration,
    /// Whether `start` restores the persisted file first.
    pub restore: bool,
    /// Fixed RNG seed for deterministic selection; `None` seeds from entropy.
    pub rng_seed: Option<u64>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            default_port: 8333,
            node_limit: 100_000,
            backup_path: PathBuf::from("nodes.dat"),
            backup_rate: Duration::from_secs(120),
            restore: true,
            rng_seed: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

const STATE_IDLE: u32 = 0;
const STATE_BUSY: u32 = 1;
const STATE_RUNNING: u32 = 2;

/// Capacity of the new-node intake queue. Overflow drops.
const NODE_QUEUE: usize = 256;

pub struct Repository {
    index: Arc<RwLock<HashMap<String, Node>>>,
    /// Current intake sender; replaced on every `start` so the repository
    /// can be restarted.
    node_tx: std::sync::RwLock<mpsc::Sender<Node>>,
    sig: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    state: AtomicU32,
    rng: std::sync::Mutex<StdRng>,
    resolver: Arc<dyn SeedResolver>,
    config: RepoConfig,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Repository {
    /// Create a repository with the system DNS resolver.
    ///
    /// Fails when the backup location cannot be prepared.
    pub fn new(config: RepoConfig) -> Result<Self, RepoError> {
        Self::with_resolver(config, Arc::new(DnsResolver))
    }

    /// Create a repository with a custom seed resolver (used by tests).
    pub fn with_resolver(
        config: RepoConfig,
        resolver: Arc<dyn SeedResolver>,
    ) -> Result<Self, RepoError> {
        if let Some(parent) = config.backup_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let (node_tx, _) = mpsc::channel(NODE_QUEUE);
        let (sig, _) = watch::channel(false);
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            index: Arc::new(RwLock::new(HashMap::new())),
            node_tx: std::sync::RwLock::new(node_tx),
            sig,
            tasks: Mutex::new(Vec::new()),
            state: AtomicU32::new(STATE_IDLE),
            rng: std::sync::Mutex::new(rng),
            resolver,
            config,
        })
    }

    /// Restore persisted nodes, launch the intake and save handlers, then
    /// bootstrap from the configured DNS seeds.
    ///
    /// Idempotent: only an Idle repository starts.
    pub async fn start(&self) {
        if self
            .state
            .compare_exchange(STATE_IDLE, STATE_BUSY, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::info!("repository starting");

        if self.config.restore {
            self.restore().await;
        }

        let (node_tx, node_rx) = mpsc::channel(NODE_QUEUE);
        *self.node_tx.write().expect("node_tx lock") = node_tx;

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_node_handler(node_rx));
        tasks.push(self.spawn_save_handler());
        drop(tasks);

        self.bootstrap().await;

        tracing::info!("repository started");
        self.state.store(STATE_RUNNING, Ordering::Release);
    }

    /// Stop the handlers and save the index one last time.
    ///
    /// Idempotent: only a Running repository stops.
    pub async fn stop(&self) {
        if self
            .state
            .compare_exchange(STATE_RUNNING, STATE_BUSY, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::info!("repository stopping");

        let _ = self.sig.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        drop(tasks);

        self.save().await;

        tracing::info!("repository stopped");
        self.state.store(STATE_IDLE, Ordering::Release);
    }

    /// Number of known nodes.
    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }

    /// Snapshot of one node's record.
    pub async fn node(&self, addr: &SocketAddr) -> Option<Node> {
        self.index.read().await.get(&addr_key(addr)).cloned()
    }

    // -----------------------------------------------------------------------
    // Background handlers
    // -----------------------------------------------------------------------

    fn spawn_node_handler(&self, mut node_rx: mpsc::Receiver<Node>) -> JoinHandle<()> {
        let index = self.index.clone();
        let mut sig = self.sig.subscribe();
        let limit = self.config.node_limit;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sig.changed() => break,
                    Some(node) = node_rx.recv() => {
                        let mut index = index.write().await;
                        if index.contains_key(&node.key()) {
                            continue;
                        }
                        if index.len() >= limit {
                            tracing::debug!("node limit reached, dropping {}", node.addr);
                            continue;
                        }
                        index.insert(node.key(), node);
                        pbtc_metrics::metrics().known_nodes.set(index.len() as i64);
                    }
                }
            }
            tracing::debug!("node handler stopped");
        })
    }

    fn spawn_save_handler(&self) -> JoinHandle<()> {
        let index = self.index.clone();
        let mut sig = self.sig.subscribe();
        let path = self.config.backup_path.clone();
        let rate = self.config.backup_rate;

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(rate);
            tick.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = sig.changed() => break,
                    _ = tick.tick() => {
                        let snapshot = index.read().await.clone();
                        if let Err(e) = store::save(&path, &snapshot) {
                            tracing::warn!("could not save node index: {}", e);
                        } else {
                            tracing::debug!("node index saved ({} nodes)", snapshot.len());
                        }
                    }
                }
            }
            tracing::debug!("save handler stopped");
        })
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    async fn save(&self) {
        let snapshot = self.index.read().await.clone();
        match store::save(&self.config.backup_path, &snapshot) {
            Ok(()) => tracing::info!("node index saved ({} nodes)", snapshot.len()),
            Err(e) => tracing::warn!("could not save node index: {}", e),
        }
    }

    async fn restore(&self) {
        let restored = match store::restore(&self.config.backup_path) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!("could not restore node index, starting empty: {}", e);
                return;
            }
        };

        let mut index = self.index.write().await;
        for (key, node) in restored {
            if index.len() >= self.config.node_limit {
                break;
            }
            index.insert(key, node);
        }
        pbtc_metrics::metrics().known_nodes.set(index.len() as i64);
        tracing::info!("node index restored ({} nodes)", index.len());
    }

    // -----------------------------------------------------------------------
    // Bootstrap
    // -----------------------------------------------------------------------

    /// Resolve every configured DNS seed and feed the results through
    /// `update`. Per-seed failures are logged and skipped.
    async fn bootstrap(&self) {
        if self.config.seeds.is_empty() {
            return;
        }
        tracing::info!("bootstrapping from {} DNS seeds", self.config.seeds.len());

        for seed in &self.config.seeds {
            let addrs = match self.resolver.resolve(seed, self.config.default_port).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    tracing::warn!("could not resolve seed {}: {}", seed, e);
                    continue;
                }
            };
            tracing::debug!("seed {} resolved to {} addresses", seed, addrs.len());
            for addr in addrs {
                self.update(addr, zero_src(&addr)).await;
            }
        }
    }
}

#[async_trait]
impl AddressBook for Repository {
    async fn update(&self, addr: SocketAddr, src: SocketAddr) {
        {
            let mut index = self.index.write().await;
            if let Some(node) = index.get_mut(&addr_key(&addr)) {
                node.src = src;
                return;
            }
        }

        // Unknown address: enqueue for the handler; drop on overflow.
        let node_tx = self.node_tx.read().expect("node_tx lock").clone();
        if node_tx.try_send(Node::new(addr, src)).is_err() {
            tracing::debug!("node queue full, dropping {}", addr);
        }
    }

    async fn attempt(&self, addr: SocketAddr) {
        let mut index = self.index.write().await;
        if let Some(node) = index.get_mut(&addr_key(&addr)) {
            node.attempts += 1;
            node.last_attempt = Some(Utc::now());
        }
    }

    async fn connected(&self, addr: SocketAddr) {
        let mut index = self.index.write().await;
        if let Some(node) = index.get_mut(&addr_key(&addr)) {
            node.last_connect = Some(Utc::now());
        }
    }

    async fn good(&self, addr: SocketAddr) {
        let mut index = self.index.write().await;
        if let Some(node) = index.get_mut(&addr_key(&addr)) {
            node.attempts = 0;
            node.last_success = Some(Utc::now());
        }
    }

    async fn get(&self) -> Result<SocketAddr, RepoError> {
        let index = self.index.read().await;
        if index.is_empty() {
            return Err(RepoError::NoNodes);
        }
        let mut rng = self.rng.lock().expect("rng lock");
        select::pick(index.values(), Utc::now(), &mut rng).ok_or(RepoError::NoNodes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn test_config(dir: &tempfile::TempDir) -> RepoConfig {
        RepoConfig {
            seeds: Vec::new(),
            default_port: 8333,
            node_limit: 100,
            backup_path: dir.path().join("nodes.dat"),
            backup_rate: Duration::from_secs(3600),
            restore: true,
            rng_seed: Some(1),
        }
    }

    async fn wait_for_len(repo: &Repository, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while repo.len().await != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!("index never reached {} nodes", expected);
        });
    }

    struct StubResolver {
        ips: Vec<SocketAddr>,
    }

    #[async_trait]
    impl SeedResolver for StubResolver {
        async fn resolve(&self, _host: &str, _port: u16) -> io::Result<Vec<SocketAddr>> {
            Ok(self.ips.clone())
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl SeedResolver for FailingResolver {
        async fn resolve(&self, host: &str, _port: u16) -> io::Result<Vec<SocketAddr>> {
            Err(io::Error::new(io::ErrorKind::NotFound, host.to_string()))
        }
    }

    #[tokio::test]
    async fn test_get_on_empty_repository() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = Repository::new(test_config(&dir)).unwrap();
        assert!(matches!(repo.get().await, Err(RepoError::NoNodes)));
    }

    #[tokio::test]
    async fn test_attempt_attempt_good() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = Repository::new(test_config(&dir)).unwrap();
        repo.start().await;

        let addr: SocketAddr = "1.2.3.4:8333".parse().unwrap();
        repo.update(addr, zero_src(&addr)).await;
        wait_for_len(&repo, 1).await;

        repo.attempt(addr).await;
        repo.attempt(addr).await;
        assert_eq!(repo.node(&addr).await.unwrap().attempts, 2);

        repo.good(addr).await;
        let node = repo.node(&addr).await.unwrap();
        assert_eq!(node.attempts, 0);
        let last_attempt = node.last_attempt.expect("attempt stamped");
        let last_success = node.last_success.expect("success stamped");
        assert!(last_success >= last_attempt);

        repo.stop().await;
    }

    #[tokio::test]
    async fn test_update_refreshes_source() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = Repository::new(test_config(&dir)).unwrap();
        repo.start().await;

        let addr: SocketAddr = "1.2.3.4:8333".parse().unwrap();
        let src1: SocketAddr = "9.9.9.9:8333".parse().unwrap();
        let src2: SocketAddr = "8.8.8.8:8333".parse().unwrap();

        repo.update(addr, src1).await;
        wait_for_len(&repo, 1).await;
        repo.update(addr, src2).await;

        assert_eq!(repo.node(&addr).await.unwrap().src, src2);
        assert_eq!(repo.len().await, 1, "address appears at most once");

        assert_eq!(repo.get().await.unwrap(), addr);

        repo.stop().await;
    }

    #[tokio::test]
    async fn test_bootstrap_respects_node_limit() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.seeds = vec!["seed.example.org".to_string()];
        config.node_limit = 2;

        let resolver = Arc::new(StubResolver {
            ips: vec![
                "10.0.0.1:8333".parse().unwrap(),
                "10.0.0.2:8333".parse().unwrap(),
                "10.0.0.3:8333".parse().unwrap(),
            ],
        });
        let repo = Repository::with_resolver(config, resolver).unwrap();
        repo.start().await;

        wait_for_len(&repo, 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(repo.len().await, 2, "index never exceeds the node limit");

        repo.stop().await;
    }

    #[tokio::test]
    async fn test_failing_seed_does_not_abort_startup() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.seeds = vec!["dead.example.org".to_string()];

        let repo = Repository::with_resolver(config, Arc::new(FailingResolver)).unwrap();
        repo.start().await;
        assert_eq!(repo.len().await, 0);
        repo.stop().await;
    }

    #[tokio::test]
    async fn test_save_restore_roundtrip_through_lifecycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(&dir);

        let addr: SocketAddr = "1.2.3.4:8333".parse().unwrap();
        {
            let repo = Repository::new(config.clone()).unwrap();
            repo.start().await;
            repo.update(addr, zero_src(&addr)).await;
            wait_for_len(&repo, 1).await;
            repo.attempt(addr).await;
            repo.good(addr).await;
            repo.stop().await;
        }

        let repo = Repository::new(config).unwrap();
        repo.start().await;
        let node = repo.node(&addr).await.expect("restored");
        assert_eq!(node.attempts, 0);
        assert!(node.last_success.is_some());
        repo.stop().await;
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = Repository::new(test_config(&dir)).unwrap();

        repo.start().await;
        repo.start().await; // no effect
        repo.stop().await;
        repo.stop().await; // no effect
        repo.start().await; // restartable
        repo.stop().await;
    }
}
