//! One peer per live TCP connection.
//!
//! A peer owns its socket and its task set: a setup task (outbound
//! connect + registration), then a read loop and a write loop under a
//! shared shutdown signal. It talks to the manager only through the
//! `peer_new`/`peer_done` channel endpoints it was constructed with, and
//! notifies `peer_done` exactly once when it terminates.

use crate::wire::{self, WireError};
use crate::NetError;
use bitcoin::network::address::Address;
use bitcoin::network::constants::ServiceFlags;
use bitcoin::network::message::NetworkMessage;
use bitcoin::network::message_network::VersionMessage;
use pbtc_common::{addr_key, Chain};
use pbtc_recorder::Recorder;
use pbtc_repo::AddressBook;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Capacity of the internal queue feeding the write loop (pong replies).
const REPLY_QUEUE: usize = 16;

/// Per-peer settings, handed down from the manager.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub chain: Chain,
    /// Protocol version offered in our `version` message.
    pub version: u32,
    pub user_agent: String,
    /// Local nonce; a remote `version` echoing it back means we dialed
    /// ourselves.
    pub nonce: u64,
    /// Period of the getaddr/ping polling round.
    pub information_rate: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
}

pub struct Peer {
    addr: SocketAddr,
    local: OnceLock<SocketAddr>,
    inbound: bool,
    cfg: PeerConfig,
    book: Arc<dyn AddressBook>,
    recorders: Arc<Vec<Arc<Recorder>>>,
    peer_new: mpsc::Sender<Arc<Peer>>,
    peer_done: mpsc::Sender<Arc<Peer>>,
    conn: tokio::sync::Mutex<Option<TcpStream>>,
    sig: watch::Sender<bool>,
    setup_task: Mutex<Option<JoinHandle<()>>>,
    run_task: Mutex<Option<JoinHandle<()>>>,
    write_task: Mutex<Option<JoinHandle<()>>>,
    /// Guards the single `peer_done` notification.
    done: AtomicBool,
    /// Negotiated protocol version, zero until the handshake completes.
    negotiated: AtomicU32,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("inbound", &self.inbound)
            .finish_non_exhaustive()
    }
}

impl Peer {
    fn new(
        addr: SocketAddr,
        inbound: bool,
        cfg: PeerConfig,
        book: Arc<dyn AddressBook>,
        recorders: Arc<Vec<Arc<Recorder>>>,
        peer_new: mpsc::Sender<Arc<Peer>>,
        peer_done: mpsc::Sender<Arc<Peer>>,
    ) -> Arc<Self> {
        let (sig, _) = watch::channel(false);
        Arc::new(Self {
            addr,
            local: OnceLock::new(),
            inbound,
            cfg,
            book,
            recorders,
            peer_new,
            peer_done,
            conn: tokio::sync::Mutex::new(None),
            sig,
            setup_task: Mutex::new(None),
            run_task: Mutex::new(None),
            write_task: Mutex::new(None),
            done: AtomicBool::new(false),
            negotiated: AtomicU32::new(0),
        })
    }

    /// Begin an asynchronous outbound connect; on success the peer
    /// registers itself on `peer_new` and waits to be started.
    pub fn outgoing(
        addr: SocketAddr,
        cfg: PeerConfig,
        book: Arc<dyn AddressBook>,
        recorders: Arc<Vec<Arc<Recorder>>>,
        peer_new: mpsc::Sender<Arc<Peer>>,
        peer_done: mpsc::Sender<Arc<Peer>>,
    ) -> Arc<Self> {
        let peer = Self::new(addr, false, cfg, book, recorders, peer_new, peer_done);

        let setup = {
            let peer = peer.clone();
            tokio::spawn(async move {
                let connect = TcpStream::connect(peer.addr);
                let stream =
                    match tokio::time::timeout(peer.cfg.connect_timeout, connect).await {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(e)) => {
                            tracing::debug!("could not connect to {}: {}", peer, e);
                            return;
                        }
                        Err(_) => {
                            tracing::debug!("connect to {} timed out", peer);
                            return;
                        }
                    };

                peer.book.connected(peer.addr).await;
                if let Ok(local) = stream.local_addr() {
                    let _ = peer.local.set(local);
                }
                *peer.conn.lock().await = Some(stream);

                let registered = peer.clone();
                if peer.peer_new.send(registered).await.is_err() {
                    tracing::debug!("manager gone, dropping {}", peer);
                }
            })
        };
        *peer.setup_task.lock().expect("setup lock") = Some(setup);

        peer
    }

    /// Wrap an accepted inbound connection and register it on `peer_new`.
    pub fn incoming(
        stream: TcpStream,
        cfg: PeerConfig,
        book: Arc<dyn AddressBook>,
        recorders: Arc<Vec<Arc<Recorder>>>,
        peer_new: mpsc::Sender<Arc<Peer>>,
        peer_done: mpsc::Sender<Arc<Peer>>,
    ) -> Result<Arc<Self>, NetError> {
        let addr = stream.peer_addr()?;
        let local = stream.local_addr()?;

        let peer = Self::new(addr, true, cfg, book, recorders, peer_new, peer_done);
        let _ = peer.local.set(local);

        let setup = {
            let peer = peer.clone();
            tokio::spawn(async move {
                *peer.conn.lock().await = Some(stream);
                let registered = peer.clone();
                if peer.peer_new.send(registered).await.is_err() {
                    tracing::debug!("manager gone, dropping {}", peer);
                }
            })
        };
        *peer.setup_task.lock().expect("setup lock") = Some(setup);

        Ok(peer)
    }

    /// Canonical index key (`host:port` of the remote).
    pub fn key(&self) -> String {
        addr_key(&self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    /// Negotiated protocol version; zero before the handshake completes.
    pub fn version(&self) -> u32 {
        self.negotiated.load(Ordering::Acquire)
    }

    fn local_addr(&self) -> SocketAddr {
        *self
            .local
            .get()
            .unwrap_or(&SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    /// Launch the peer's main task. Called by the manager once the peer
    /// is accepted into the index.
    pub fn start(self: &Arc<Self>) {
        let peer = self.clone();
        let run = tokio::spawn(async move {
            let mut sig = peer.sig.subscribe();
            // A stop that raced ahead of this task is already latched;
            // skip straight to the done notification.
            if !*sig.borrow() {
                let outcome = tokio::select! {
                    _ = sig.changed() => Ok(()),
                    res = peer.drive() => res,
                };
                match outcome {
                    Ok(()) => tracing::debug!("peer {} closing", peer),
                    Err(e) => tracing::info!("peer {} terminated: {}", peer, e),
                }
                let _ = peer.sig.send(true);
            }

            // Every termination path ends here, external stops included.
            if !peer.done.swap(true, Ordering::AcqRel) {
                let _ = peer.peer_done.send(peer.clone()).await;
            }
        });
        *self.run_task.lock().expect("run lock") = Some(run);
    }

    /// Signal shutdown and wait for every task owned by this peer.
    /// Idempotent (each task handle is taken at most once) and safe to
    /// call from any task except the peer's own. A stopped running peer
    /// still notifies `peer_done` as its run task unwinds.
    pub async fn stop(&self) {
        let _ = self.sig.send(true);

        for slot in [&self.setup_task, &self.run_task, &self.write_task] {
            let task = slot.lock().expect("task lock").take();
            if let Some(task) = task {
                let _ = task.await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Connection driving
    // -----------------------------------------------------------------------

    async fn drive(self: &Arc<Self>) -> Result<(), NetError> {
        let stream = self
            .conn
            .lock()
            .await
            .take()
            .ok_or(NetError::NotConnected)?;
        let (mut reader, mut writer) = stream.into_split();

        let handshake = self.handshake(&mut reader, &mut writer);
        let remote_version =
            match tokio::time::timeout(self.cfg.handshake_timeout, handshake).await {
                Ok(result) => result?,
                Err(_) => return Err(NetError::HandshakeTimeout),
            };

        let negotiated = self.cfg.version.min(remote_version);
        self.negotiated.store(negotiated, Ordering::Release);
        self.book.good(self.addr).await;
        pbtc_metrics::metrics().handshakes_completed.inc();
        tracing::debug!("peer {} handshake complete, version {}", self, negotiated);

        let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE);
        let write = {
            let peer = self.clone();
            tokio::spawn(async move { peer.write_loop(writer, reply_rx).await })
        };
        *self.write_task.lock().expect("write lock") = Some(write);

        self.read_loop(&mut reader, reply_tx).await
    }

    /// Version/verack exchange. The dialing side offers its version
    /// first; the accepting side answers with its own version and a
    /// verack. Returns the remote's offered protocol version.
    async fn handshake(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<u32, NetError> {
        let magic = self.cfg.chain.magic();

        if !self.inbound {
            wire::write_message(writer, magic, self.version_message()).await?;
        }

        let mut remote_version = None;
        let mut verack = false;

        while remote_version.is_none() || !verack {
            let raw = wire::read_message(reader, magic).await?;
            self.deliver(&raw.payload).await;

            match raw.payload {
                NetworkMessage::Version(v) => {
                    if v.nonce == self.cfg.nonce {
                        return Err(NetError::SelfConnect);
                    }
                    if remote_version.replace(v.version).is_some() {
                        return Err(NetError::Violation("duplicate version"));
                    }
                    if self.inbound {
                        wire::write_message(writer, magic, self.version_message()).await?;
                    }
                    wire::write_message(writer, magic, NetworkMessage::Verack).await?;
                }
                NetworkMessage::Verack => {
                    if remote_version.is_none() {
                        return Err(NetError::Violation("verack before version"));
                    }
                    verack = true;
                }
                // Anything else before the handshake finishes is noise;
                // it was recorded above and is otherwise ignored.
                _ => {}
            }
        }

        Ok(remote_version.unwrap_or_default())
    }

    fn version_message(&self) -> NetworkMessage {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        NetworkMessage::Version(VersionMessage {
            version: self.cfg.version,
            services: ServiceFlags::NONE,
            timestamp,
            receiver: Address::new(&self.addr, ServiceFlags::NONE),
            sender: Address::new(&self.local_addr(), ServiceFlags::NONE),
            nonce: self.cfg.nonce,
            user_agent: self.cfg.user_agent.clone(),
            start_height: 0,
            relay: false,
        })
    }

    /// Decode frames until the connection fails or shutdown is signalled
    /// (the caller races this future against the signal).
    async fn read_loop(
        self: &Arc<Self>,
        reader: &mut OwnedReadHalf,
        reply_tx: mpsc::Sender<NetworkMessage>,
    ) -> Result<(), NetError> {
        let magic = self.cfg.chain.magic();
        let metrics = pbtc_metrics::metrics();

        loop {
            let raw = wire::read_message(reader, magic).await?;
            metrics.messages_received.inc();
            metrics
                .messages_by_command
                .with_label_values(&[raw.payload.cmd()])
                .inc();

            match &raw.payload {
                NetworkMessage::Addr(list) => {
                    for (_, gossiped) in list {
                        if let Ok(sock) = gossiped.socket_addr() {
                            self.book.update(sock, self.addr).await;
                        }
                    }
                }
                NetworkMessage::Ping(nonce) => {
                    let _ = reply_tx.send(NetworkMessage::Pong(*nonce)).await;
                }
                NetworkMessage::Version(_) => {
                    return Err(NetError::Violation("version after handshake"));
                }
                _ => {}
            }

            self.deliver(&raw.payload).await;
        }
    }

    /// Serialize queued replies and run the periodic getaddr/ping round.
    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut reply_rx: mpsc::Receiver<NetworkMessage>,
    ) {
        let magic = self.cfg.chain.magic();
        let mut sig = self.sig.subscribe();
        if *sig.borrow() {
            return;
        }
        let mut poll = tokio::time::interval(self.cfg.information_rate);

        let failed: Option<WireError> = loop {
            tokio::select! {
                _ = sig.changed() => break None,

                _ = poll.tick() => {
                    if let Err(e) = wire::write_message(&mut writer, magic, NetworkMessage::GetAddr).await {
                        break Some(e);
                    }
                    let nonce: u64 = rand::random();
                    if let Err(e) = wire::write_message(&mut writer, magic, NetworkMessage::Ping(nonce)).await {
                        break Some(e);
                    }
                }

                reply = reply_rx.recv() => {
                    let Some(msg) = reply else { break None };
                    if let Err(e) = wire::write_message(&mut writer, magic, msg).await {
                        break Some(e);
                    }
                }
            }
        };

        if let Some(e) = failed {
            tracing::debug!("peer {} write failed: {}", self, e);
            // Wake the read side so the peer terminates promptly.
            let _ = self.sig.send(true);
        }
    }

    /// Hand one decoded message to every attached recorder, in order.
    async fn deliver(&self, msg: &NetworkMessage) {
        let local = self.local_addr();
        for recorder in self.recorders.iter() {
            recorder.record(msg, self.addr, local).await;
        }
    }
}
