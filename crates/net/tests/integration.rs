//! Integration tests: drive the manager and peers against fake remote
//! peers that speak the real version/verack handshake over TCP.

use async_trait::async_trait;
use bitcoin::network::address::Address;
use bitcoin::network::constants::ServiceFlags;
use bitcoin::network::message::NetworkMessage;
use bitcoin::network::message_network::VersionMessage;
use pbtc_common::Chain;
use pbtc_net::{wire, Manager, ManagerConfig, Peer, PeerConfig};
use pbtc_repo::{AddressBook, RepoError};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout, Duration};

const CHAIN: Chain = Chain::Mainnet;

// ---------------------------------------------------------------------------
// Mock address book
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockBook {
    queue: Mutex<VecDeque<SocketAddr>>,
    attempts: Mutex<Vec<SocketAddr>>,
    goods: Mutex<Vec<SocketAddr>>,
    updates: Mutex<Vec<(SocketAddr, SocketAddr)>>,
}

impl MockBook {
    fn with_addrs(addrs: Vec<SocketAddr>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(addrs.into()),
            ..Default::default()
        })
    }

    async fn attempt_count(&self) -> usize {
        self.attempts.lock().await.len()
    }

    async fn good_count(&self) -> usize {
        self.goods.lock().await.len()
    }
}

#[async_trait]
impl AddressBook for MockBook {
    async fn update(&self, addr: SocketAddr, src: SocketAddr) {
        self.updates.lock().await.push((addr, src));
    }

    async fn attempt(&self, addr: SocketAddr) {
        self.attempts.lock().await.push(addr);
    }

    async fn connected(&self, _addr: SocketAddr) {}

    async fn good(&self, addr: SocketAddr) {
        self.goods.lock().await.push(addr);
    }

    /// Cycles through the configured addresses.
    async fn get(&self) -> Result<SocketAddr, RepoError> {
        let mut queue = self.queue.lock().await;
        let addr = queue.pop_front().ok_or(RepoError::NoNodes)?;
        queue.push_back(addr);
        Ok(addr)
    }
}

// ---------------------------------------------------------------------------
// Fake remote peers
// ---------------------------------------------------------------------------

fn remote_version(nonce: u64) -> NetworkMessage {
    let unspec: SocketAddr = "0.0.0.0:0".parse().unwrap();
    NetworkMessage::Version(VersionMessage {
        version: 70011,
        services: ServiceFlags::NETWORK,
        timestamp: 0,
        receiver: Address::new(&unspec, ServiceFlags::NONE),
        sender: Address::new(&unspec, ServiceFlags::NONE),
        nonce,
        user_agent: "/fake:0.0.1/".to_string(),
        start_height: 0,
        relay: false,
    })
}

/// Accepting side of the handshake: wait for the crawler's version, answer
/// with our own version and a verack, stay up for `lifetime`, then drop.
async fn serve_connection(mut stream: TcpStream, lifetime: Duration) {
    let magic = CHAIN.magic();
    let (mut reader, mut writer) = stream.split();

    let first = match wire::read_message(&mut reader, magic).await {
        Ok(raw) => raw.payload,
        Err(_) => return,
    };
    if !matches!(first, NetworkMessage::Version(_)) {
        return;
    }

    let nonce: u64 = rand::random();
    if wire::write_message(&mut writer, magic, remote_version(nonce)).await.is_err() {
        return;
    }
    if wire::write_message(&mut writer, magic, NetworkMessage::Verack).await.is_err() {
        return;
    }

    sleep(lifetime).await;
}

/// Spawn a fake remote peer; returns its address.
async fn spawn_fake_remote(lifetime: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            tokio::spawn(serve_connection(stream, lifetime));
        }
    });

    addr
}

fn test_manager_config() -> ManagerConfig {
    ManagerConfig {
        chain: CHAIN,
        connection_rate: 100.0,
        information_rate: Duration::from_secs(5),
        peer_limit: 3,
        listen: false,
        connect_timeout: Duration::from_secs(1),
        handshake_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn test_peer_config(nonce: u64) -> PeerConfig {
    PeerConfig {
        chain: CHAIN,
        version: 70013,
        user_agent: "/pbtc-test:0.0.1/".to_string(),
        nonce,
        information_rate: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(1),
        handshake_timeout: Duration::from_secs(2),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_manager_respects_peer_limit_and_rate() {
    let mut addrs = Vec::new();
    for _ in 0..10 {
        addrs.push(spawn_fake_remote(Duration::from_millis(200)).await);
    }

    let book = MockBook::with_addrs(addrs);
    let manager = Manager::new(test_manager_config(), book.clone(), Vec::new());
    manager.start().await;

    let mut peak = 0;
    for _ in 0..50 {
        peak = peak.max(manager.peer_count().await);
        sleep(Duration::from_millis(20)).await;
    }

    timeout(Duration::from_secs(5), manager.stop())
        .await
        .expect("stop must not deadlock");

    assert!(peak <= 3, "peer index exceeded the limit: {}", peak);
    assert!(peak > 0, "no peer ever connected");

    let attempts = book.attempt_count().await;
    assert!(attempts >= 3, "expected at least a few dials, got {}", attempts);
    assert!(
        attempts <= 110,
        "dial rate exceeded the configured bound: {}",
        attempts
    );

    assert!(book.good_count().await > 0, "no handshake ever completed");
    assert_eq!(manager.peer_count().await, 0, "index must be empty after stop");
}

#[tokio::test]
async fn test_manager_start_stop_idempotent() {
    let book = MockBook::with_addrs(Vec::new());
    let manager = Manager::new(test_manager_config(), book, Vec::new());

    manager.start().await;
    manager.start().await; // no effect
    manager.stop().await;
    manager.stop().await; // no effect

    // Restartable after a full stop.
    manager.start().await;
    timeout(Duration::from_secs(5), manager.stop())
        .await
        .expect("second stop must not deadlock");
}

#[tokio::test]
async fn test_outgoing_peer_lifecycle() {
    let remote = spawn_fake_remote(Duration::from_millis(100)).await;
    let book = MockBook::with_addrs(Vec::new());

    let (new_tx, mut new_rx) = mpsc::channel(1);
    let (done_tx, mut done_rx) = mpsc::channel(1);

    let peer = Peer::outgoing(
        remote,
        test_peer_config(42),
        book.clone(),
        Arc::new(Vec::new()),
        new_tx,
        done_tx,
    );
    assert_eq!(peer.addr(), remote);

    // The peer registers itself once connected.
    let registered = timeout(Duration::from_secs(2), new_rx.recv())
        .await
        .expect("registration timed out")
        .expect("channel open");
    assert_eq!(registered.key(), peer.key());

    registered.start();

    // The fake remote hangs up after 100ms; expect exactly one done signal.
    let done = timeout(Duration::from_secs(2), done_rx.recv())
        .await
        .expect("done timed out")
        .expect("channel open");
    assert_eq!(done.key(), peer.key());

    assert_eq!(book.good_count().await, 1, "handshake should be marked good");
    assert_eq!(done.version(), 70011, "negotiated version is the remote's lower offer");
}

#[tokio::test]
async fn test_self_connect_is_rejected() {
    // An echo remote that answers with whatever nonce the crawler sent.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let magic = CHAIN.magic();
        let Ok((mut stream, _)) = listener.accept().await else { return };
        let (mut reader, mut writer) = stream.split();
        let Ok(raw) = wire::read_message(&mut reader, magic).await else { return };
        let NetworkMessage::Version(v) = raw.payload else { return };
        let _ = wire::write_message(&mut writer, magic, remote_version(v.nonce)).await;
        let _ = wire::write_message(&mut writer, magic, NetworkMessage::Verack).await;
        sleep(Duration::from_secs(1)).await;
    });

    let book = MockBook::with_addrs(Vec::new());
    let (new_tx, mut new_rx) = mpsc::channel(1);
    let (done_tx, mut done_rx) = mpsc::channel(1);

    let peer = Peer::outgoing(
        remote,
        test_peer_config(42),
        book.clone(),
        Arc::new(Vec::new()),
        new_tx,
        done_tx,
    );

    let registered = timeout(Duration::from_secs(2), new_rx.recv())
        .await
        .expect("registration timed out")
        .expect("channel open");
    registered.start();

    let done = timeout(Duration::from_secs(2), done_rx.recv())
        .await
        .expect("self-connect must terminate the peer")
        .expect("channel open");
    assert_eq!(done.key(), peer.key());
    assert_eq!(book.good_count().await, 0, "self-connect must not count as good");
}

#[tokio::test]
async fn test_inbound_peer_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    let magic = CHAIN.magic();

    // Remote initiator: dials us, offers its version, acks ours.
    tokio::spawn(async move {
        let Ok(mut stream) = TcpStream::connect(server_addr).await else { return };
        let (mut reader, mut writer) = stream.split();
        let nonce: u64 = rand::random();
        let _ = wire::write_message(&mut writer, magic, remote_version(nonce)).await;
        loop {
            match wire::read_message(&mut reader, magic).await {
                Ok(raw) => match raw.payload {
                    NetworkMessage::Version(_) => {
                        let _ = wire::write_message(&mut writer, magic, NetworkMessage::Verack).await;
                    }
                    NetworkMessage::Verack => break,
                    _ => {}
                },
                Err(_) => return,
            }
        }
        sleep(Duration::from_millis(100)).await;
    });

    let book = MockBook::with_addrs(Vec::new());
    let (new_tx, mut new_rx) = mpsc::channel(1);
    let (done_tx, mut done_rx) = mpsc::channel(1);

    let (stream, _) = listener.accept().await.unwrap();
    let peer = Peer::incoming(
        stream,
        test_peer_config(42),
        book.clone(),
        Arc::new(Vec::new()),
        new_tx,
        done_tx,
    )
    .unwrap();
    assert!(peer.is_inbound());

    let registered = timeout(Duration::from_secs(2), new_rx.recv())
        .await
        .expect("registration timed out")
        .expect("channel open");
    registered.start();

    let done = timeout(Duration::from_secs(2), done_rx.recv())
        .await
        .expect("done timed out")
        .expect("channel open");
    assert_eq!(done.key(), peer.key());
    assert_eq!(book.good_count().await, 1);
}

#[tokio::test]
async fn test_peer_stop_is_idempotent() {
    let remote = spawn_fake_remote(Duration::from_secs(5)).await;
    let book = MockBook::with_addrs(Vec::new());

    let (new_tx, mut new_rx) = mpsc::channel(1);
    let (done_tx, mut done_rx) = mpsc::channel(1);

    let peer = Peer::outgoing(
        remote,
        test_peer_config(42),
        book,
        Arc::new(Vec::new()),
        new_tx,
        done_tx,
    );

    let registered = timeout(Duration::from_secs(2), new_rx.recv())
        .await
        .expect("registration timed out")
        .expect("channel open");
    registered.start();

    // Give the handshake a moment, then stop twice.
    sleep(Duration::from_millis(200)).await;
    peer.stop().await;
    peer.stop().await;

    // An external stop is one of the done triggers; expect exactly one
    // notification even though stop was called twice.
    let done = timeout(Duration::from_millis(500), done_rx.recv())
        .await
        .expect("stopped peer must notify done")
        .expect("channel open");
    assert_eq!(done.key(), peer.key());
    assert!(
        timeout(Duration::from_millis(200), done_rx.recv()).await.is_err(),
        "done must be signalled exactly once"
    );
}
