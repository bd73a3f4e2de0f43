#![forbid(unsafe_code)]

//! Shared harness for spinning up a full node stack on loopback for the
//! integration tests in this directory.

use meshfs::core::codec::{read_frame, write_frame};
use meshfs::core::store::local::LocalStore;
use meshfs::core::store::metadata::MetadataStore;
use meshfs::core::types::{Envelope, MessageType, NodeStats, Peer};
use meshfs::monitoring::metrics::Metrics;
use meshfs::networking::commands::CommandHandler;
use meshfs::networking::peer_registry::PeerRegistry;
use meshfs::networking::replication::{ReplicationConfig, ReplicationEngine};
use meshfs::networking::router::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

pub struct Node {
    pub node_id: String,
    pub addr: SocketAddr,
    pub metadata: Arc<MetadataStore>,
    pub local: Arc<LocalStore>,
    pub registry: Arc<PeerRegistry>,
    pub replication: Arc<ReplicationEngine>,
    pub commands: Arc<CommandHandler>,
    pub metrics: Arc<Metrics>,
    _dir: tempfile::TempDir,
    _shutdown: tokio::sync::watch::Sender<bool>,
}

impl Node {
    pub fn peer(&self) -> Peer {
        self.registry.get(&self.node_id).unwrap_or(Peer {
            node_id: self.node_id.clone(),
            host: self.addr.ip().to_string(),
            tcp_port: self.addr.port(),
            last_seen: meshfs::core::codec::now_secs(),
            liveness: meshfs::core::types::Liveness::Alive,
            version_string: String::new(),
            stats: NodeStats::default(),
        })
    }

    /// Record `other` as an alive peer of this node, and vice versa isn't
    /// implied — call this on both sides to make two nodes mutually aware.
    pub fn observe(&self, other: &Node) {
        self.registry.observe(
            &other.node_id,
            &other.addr.ip().to_string(),
            other.addr.port(),
            meshfs::core::codec::now_secs(),
            String::new(),
            NodeStats::default(),
        );
    }

    /// Send one command envelope over a fresh TCP connection and return the response.
    pub async fn send_command(&self, action: &str, path: &str, content: serde_json::Value) -> Envelope {
        let env = Envelope {
            kind: MessageType::Command,
            action: action.to_string(),
            path: path.to_string(),
            content,
            origin: "test-client".to_string(),
            timestamp: meshfs::core::codec::now_secs(),
            checksum: String::new(),
            sequence: None,
        };
        roundtrip(self.addr, env).await
    }

    /// Stop this node's router so its TCP port starts refusing connections.
    pub async fn stop(self) {
        let _ = self._shutdown.send(true);
        // give the accept loop's select! a turn to observe the signal and drop the listener.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub async fn roundtrip(addr: SocketAddr, env: Envelope) -> Envelope {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    write_frame(&mut stream, &env).await.expect("write request");
    read_frame(&mut stream, 64 * 1024 * 1024).await.expect("read response")
}

pub async fn spawn_node(node_id: &str) -> Node {
    spawn_node_with_retry(node_id, 2, 1).await
}

pub async fn spawn_node_with_retry(node_id: &str, retry_attempts: u32, retry_base_secs: u64) -> Node {
    let dir = tempfile::tempdir().expect("tempdir");
    let metadata = Arc::new(
        MetadataStore::open(dir.path().join("metadata.db"))
            .await
            .expect("open metadata store"),
    );
    let local = Arc::new(
        LocalStore::open(dir.path().join("root"))
            .await
            .expect("open local store"),
    );
    let registry = Arc::new(PeerRegistry::new());
    let metrics = Arc::new(Metrics::new().expect("build metrics"));
    let replication = ReplicationEngine::new(
        metadata.clone(),
        local.clone(),
        registry.clone(),
        node_id.to_string(),
        ReplicationConfig {
            batch_size: 10,
            verify_checksums: true,
            retry_attempts,
            retry_base_secs,
            connection_deadline: Duration::from_secs(2),
        },
        metrics.clone(),
    );
    let commands = CommandHandler::new(
        metadata.clone(),
        local.clone(),
        replication.clone(),
        node_id.to_string(),
        metrics.clone(),
    );
    let router = Router::new(
        commands.clone(),
        replication.clone(),
        registry.clone(),
        node_id.to_string(),
        64 * 1024 * 1024,
        2.0,
        metrics.clone(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(router.run(listener, shutdown_rx));

    Node {
        node_id: node_id.to_string(),
        addr,
        metadata,
        local,
        registry,
        replication,
        commands,
        metrics,
        _dir: dir,
        _shutdown: shutdown_tx,
    }
}
