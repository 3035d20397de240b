//! The connection manager.
//!
//! Keeps the peer population in line with the configured limits: accepts
//! inbound connections on every local IPv4 interface, dials outbound at a
//! bounded rate using addresses from the repository, and owns the
//! lifecycle of every tracked peer. A single handler task serializes all
//! peer-index mutations.

use crate::peer::{Peer, PeerConfig};
use pbtc_common::{addr_key, find_local_ipv4s, Chain};
use pbtc_recorder::Recorder;
use pbtc_repo::AddressBook;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;

const STATE_IDLE: u32 = 0;
const STATE_BUSY: u32 = 1;
const STATE_RUNNING: u32 = 2;

/// Tries per dial tick to find an address not already connected.
const MAX_ADDR_ATTEMPTS: usize = 10;

const PEER_NEW_QUEUE: usize = 16;
const PEER_DONE_QUEUE: usize = 64;

/// Runtime settings for a [`Manager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub chain: Chain,
    /// Protocol version offered to peers.
    pub protocol_version: u32,
    pub user_agent: String,
    /// Outbound dial attempts per second.
    pub connection_rate: f64,
    /// Period of each peer's getaddr/ping round.
    pub information_rate: Duration,
    /// Maximum number of simultaneously tracked peers.
    pub peer_limit: usize,
    /// Port listened on and dialed (normally the chain default).
    pub port: u16,
    /// Whether to accept inbound connections.
    pub listen: bool,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            chain: Chain::Mainnet,
            protocol_version: 70013,
            user_agent: "/pbtc:0.1.0/".to_string(),
            connection_rate: 25.0,
            information_rate: Duration::from_secs(10),
            peer_limit: 1000,
            port: Chain::Mainnet.default_port(),
            listen: true,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything created for one Running period and torn down on stop.
struct RunState {
    sig_conn: watch::Sender<bool>,
    sig_listen: watch::Sender<bool>,
    sig_peer: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Manager<B: AddressBook> {
    book: Arc<B>,
    recorders: Arc<Vec<Arc<Recorder>>>,
    peer_index: Arc<RwLock<HashMap<String, Arc<Peer>>>>,
    state: AtomicU32,
    nonce: u64,
    config: ManagerConfig,
    run: Mutex<Option<RunState>>,
}

impl<B: AddressBook> std::fmt::Debug for Manager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<B: AddressBook> Manager<B> {
    pub fn new(config: ManagerConfig, book: Arc<B>, recorders: Vec<Arc<Recorder>>) -> Self {
        Self {
            book,
            recorders: Arc::new(recorders),
            peer_index: Arc::new(RwLock::new(HashMap::new())),
            state: AtomicU32::new(STATE_IDLE),
            nonce: rand::random(),
            config,
            run: Mutex::new(None),
        }
    }

    /// Number of currently tracked peers.
    pub async fn peer_count(&self) -> usize {
        self.peer_index.read().await.len()
    }

    /// Open listeners, then launch the dial loop and the peer handler.
    ///
    /// Idempotent: only an Idle manager starts.
    pub async fn start(&self) {
        if self
            .state
            .compare_exchange(STATE_IDLE, STATE_BUSY, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::info!("manager starting");

        let (peer_new_tx, peer_new_rx) = mpsc::channel(PEER_NEW_QUEUE);
        let (peer_done_tx, peer_done_rx) = mpsc::channel(PEER_DONE_QUEUE);
        let (sig_conn, _) = watch::channel(false);
        let (sig_listen, _) = watch::channel(false);
        let (sig_peer, _) = watch::channel(false);

        let peer_cfg = PeerConfig {
            chain: self.config.chain,
            version: self.config.protocol_version,
            user_agent: self.config.user_agent.clone(),
            nonce: self.nonce,
            information_rate: self.config.information_rate,
            connect_timeout: self.config.connect_timeout,
            handshake_timeout: self.config.handshake_timeout,
        };

        let mut tasks = Vec::new();

        if self.config.listen {
            tasks.extend(
                self.create_listeners(&peer_cfg, &peer_new_tx, &peer_done_tx, &sig_listen)
                    .await,
            );
        }

        tasks.push(self.spawn_dial_loop(
            &peer_cfg,
            &peer_new_tx,
            &peer_done_tx,
            sig_conn.subscribe(),
        ));
        tasks.push(self.spawn_peer_handler(peer_new_rx, peer_done_rx, sig_peer.subscribe()));

        *self.run.lock().await = Some(RunState {
            sig_conn,
            sig_listen,
            sig_peer,
            tasks,
        });

        tracing::info!("manager started");
        self.state.store(STATE_RUNNING, Ordering::Release);
    }

    /// Stop every peer, then tear down in the mandatory order: dial
    /// signal, listeners, peer handler, join.
    ///
    /// Idempotent: only a Running manager stops.
    pub async fn stop(&self) {
        if self
            .state
            .compare_exchange(STATE_RUNNING, STATE_BUSY, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::info!("manager stopping");

        let peers: Vec<Arc<Peer>> = self.peer_index.read().await.values().cloned().collect();
        tracing::debug!("stopping {} peers", peers.len());
        for peer in peers {
            peer.stop().await;
        }

        if let Some(run) = self.run.lock().await.take() {
            let _ = run.sig_conn.send(true);
            let _ = run.sig_listen.send(true);
            let _ = run.sig_peer.send(true);
            for task in run.tasks {
                let _ = task.await;
            }
        }

        // Peers indexed between the sweep above and the handler exiting.
        let stragglers: Vec<Arc<Peer>> =
            self.peer_index.write().await.drain().map(|(_, p)| p).collect();
        for peer in stragglers {
            peer.stop().await;
        }
        pbtc_metrics::metrics().connected_peers.set(0);

        tracing::info!("manager stopped");
        self.state.store(STATE_IDLE, Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    /// Try to open one listener per local non-loopback IPv4 interface.
    /// Individual failures are logged and skipped.
    async fn create_listeners(
        &self,
        peer_cfg: &PeerConfig,
        peer_new_tx: &mpsc::Sender<Arc<Peer>>,
        peer_done_tx: &mpsc::Sender<Arc<Peer>>,
        sig_listen: &watch::Sender<bool>,
    ) -> Vec<JoinHandle<()>> {
        let ips = find_local_ipv4s();
        tracing::debug!("{} local IPs found", ips.len());

        let mut tasks = Vec::new();
        for ip in ips {
            let addr = SocketAddr::from((ip, self.config.port));
            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::warn!("could not listen on {}: {}", addr, e);
                    continue;
                }
            };
            tracing::info!("listening on {}", addr);

            tasks.push(tokio::spawn(accept_loop(
                listener,
                peer_cfg.clone(),
                self.book.clone(),
                self.recorders.clone(),
                peer_new_tx.clone(),
                peer_done_tx.clone(),
                sig_listen.subscribe(),
            )));
        }
        tasks
    }

    // -----------------------------------------------------------------------
    // Dial loop
    // -----------------------------------------------------------------------

    fn spawn_dial_loop(
        &self,
        peer_cfg: &PeerConfig,
        peer_new_tx: &mpsc::Sender<Arc<Peer>>,
        peer_done_tx: &mpsc::Sender<Arc<Peer>>,
        mut sig: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let book: Arc<dyn AddressBook> = self.book.clone();
        let recorders = self.recorders.clone();
        let peer_index = self.peer_index.clone();
        let peer_cfg = peer_cfg.clone();
        let peer_new_tx = peer_new_tx.clone();
        let peer_done_tx = peer_done_tx.clone();
        let peer_limit = self.config.peer_limit;
        let period = Duration::from_secs_f64(1.0 / self.config.connection_rate);

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = sig.changed() => break,
                    _ = tick.tick() => {
                        if peer_index.read().await.len() >= peer_limit {
                            continue;
                        }
                        add_peer(
                            &book,
                            &peer_index,
                            &peer_cfg,
                            &recorders,
                            &peer_new_tx,
                            &peer_done_tx,
                        )
                        .await;
                    }
                }
            }
            tracing::debug!("dial loop stopped");
        })
    }

    // -----------------------------------------------------------------------
    // Peer handler
    // -----------------------------------------------------------------------

    fn spawn_peer_handler(
        &self,
        mut peer_new_rx: mpsc::Receiver<Arc<Peer>>,
        mut peer_done_rx: mpsc::Receiver<Arc<Peer>>,
        mut sig: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let peer_index = self.peer_index.clone();
        let peer_limit = self.config.peer_limit;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sig.changed() => break,

                    Some(peer) = peer_new_rx.recv() => {
                        process_new_peer(&peer_index, peer_limit, peer).await;
                    }

                    Some(peer) = peer_done_rx.recv() => {
                        process_done_peer(&peer_index, peer).await;
                    }
                }
            }
            tracing::debug!("peer handler stopped");
        })
    }
}

// ---------------------------------------------------------------------------
// Free helpers (shared by the spawned tasks)
// ---------------------------------------------------------------------------

/// Accept inbound connections until shutdown. Accept errors other than
/// shutdown terminate this listener with a warning but leave the rest of
/// the manager running.
async fn accept_loop(
    listener: TcpListener,
    peer_cfg: PeerConfig,
    book: Arc<dyn AddressBook>,
    recorders: Arc<Vec<Arc<Recorder>>>,
    peer_new_tx: mpsc::Sender<Arc<Peer>>,
    peer_done_tx: mpsc::Sender<Arc<Peer>>,
    mut sig: watch::Receiver<bool>,
) {
    let local = listener.local_addr().ok();

    loop {
        tokio::select! {
            _ = sig.changed() => break,

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!("accepted inbound connection from {}", addr);
                        let result = Peer::incoming(
                            stream,
                            peer_cfg.clone(),
                            book.clone(),
                            recorders.clone(),
                            peer_new_tx.clone(),
                            peer_done_tx.clone(),
                        );
                        if let Err(e) = result {
                            tracing::warn!("could not create inbound peer: {}", e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("accept failed on {:?}: {}", local, e);
                        break;
                    }
                }
            }
        }
    }

    tracing::debug!("listener on {:?} stopped", local);
}

/// One dial attempt: ask the repository for an address not already in the
/// peer index (up to [`MAX_ADDR_ATTEMPTS`] tries), then begin a connect.
async fn add_peer(
    book: &Arc<dyn AddressBook>,
    peer_index: &RwLock<HashMap<String, Arc<Peer>>>,
    peer_cfg: &PeerConfig,
    recorders: &Arc<Vec<Arc<Recorder>>>,
    peer_new_tx: &mpsc::Sender<Arc<Peer>>,
    peer_done_tx: &mpsc::Sender<Arc<Peer>>,
) {
    for _ in 0..MAX_ADDR_ATTEMPTS {
        let addr = match book.get().await {
            Ok(addr) => addr,
            Err(e) => {
                tracing::debug!("repository has no address to dial: {}", e);
                return;
            }
        };

        if peer_index.read().await.contains_key(&addr_key(&addr)) {
            continue;
        }

        tracing::debug!("dialing {}", addr);
        Peer::outgoing(
            addr,
            peer_cfg.clone(),
            book.clone(),
            recorders.clone(),
            peer_new_tx.clone(),
            peer_done_tx.clone(),
        );
        book.attempt(addr).await;
        pbtc_metrics::metrics().dial_attempts.inc();
        return;
    }

    tracing::debug!("could not find a dialable address");
}

/// A freshly registered peer: discard it if already indexed or over the
/// limit, otherwise start and index it.
async fn process_new_peer(
    peer_index: &RwLock<HashMap<String, Arc<Peer>>>,
    peer_limit: usize,
    peer: Arc<Peer>,
) {
    let key = peer.key();

    {
        // Discarded peers were never started: stop() only joins the setup
        // task, and with no run task there is no peer_done notification
        // for a peer that was never in the index.
        let mut index = peer_index.write().await;
        if index.contains_key(&key) {
            drop(index);
            tracing::debug!("already connected to {}, discarding", peer);
            peer.stop().await;
            return;
        }
        if index.len() >= peer_limit {
            drop(index);
            tracing::debug!("peer limit reached, discarding {}", peer);
            peer.stop().await;
            return;
        }

        peer.start();
        index.insert(key, peer);
        pbtc_metrics::metrics().connected_peers.set(index.len() as i64);
    }
}

/// A self-terminated peer: drop it from the index. Duplicate signals are
/// tolerated.
async fn process_done_peer(peer_index: &RwLock<HashMap<String, Arc<Peer>>>, peer: Arc<Peer>) {
    let removed = peer_index.write().await.remove(&peer.key());
    match removed {
        Some(peer) => {
            peer.stop().await;
            let len = peer_index.read().await.len();
            pbtc_metrics::metrics().connected_peers.set(len as i64);
            tracing::debug!("removed done peer {}", peer);
        }
        None => {
            tracing::debug!("done peer {} already removed", peer);
        }
    }
}
