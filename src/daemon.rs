// Copyright (c) 2026 Meshfs
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Composes every long-lived service as owned components of one daemon
//! value, constructed at startup and torn down on shutdown (spec §4.8, §9:
//! "not as global singletons").

use crate::core::codec::now_secs;
use crate::core::error::DaemonError;
use crate::core::store::local::LocalStore;
use crate::core::store::metadata::MetadataStore;
use crate::core::types::{NodeConfig, NodeStats};
use crate::monitoring::metrics::Metrics;
use crate::networking::commands::CommandHandler;
use crate::networking::discovery;
use crate::networking::heartbeat::{HeartbeatService, LivenessEvent};
use crate::networking::peer_registry::PeerRegistry;
use crate::networking::replication::{ReplicationConfig, ReplicationEngine};
use crate::networking::router::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Bounded wait for background tasks to drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// A fully wired node: every subsystem plus the task handles that run them.
pub struct Daemon {
    node_id: String,
    metadata: Arc<MetadataStore>,
    registry: Arc<PeerRegistry>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Open the stores, bind the sockets, and start every background
    /// service, in the order spec §4.8 mandates.
    pub async fn start(config: NodeConfig) -> Result<Self, DaemonError> {
        let node_id = config.node.name.clone();
        if node_id.is_empty() {
            return Err(DaemonError::Config("node.name must not be empty".to_string()));
        }

        let metadata = Arc::new(MetadataStore::open(&config.filesystem.metadata_db).await?);
        let local = Arc::new(LocalStore::open(&config.filesystem.root_path).await?);
        let registry = Arc::new(PeerRegistry::new());
        let metrics = Arc::new(Metrics::new()?);

        let tcp_listener = TcpListener::bind((
            config.network.bind_address.as_str(),
            config.network.tcp_port,
        ))
        .await?;
        info!(addr = %tcp_listener.local_addr().unwrap(), "router listening");

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let mut tasks = Vec::new();

        let replication = ReplicationEngine::new(
            metadata.clone(),
            local.clone(),
            registry.clone(),
            node_id.clone(),
            ReplicationConfig {
                batch_size: config.sync.batch_size,
                verify_checksums: config.sync.verify_checksums,
                retry_attempts: crate::core::types::defaults::sync_retry_attempts(),
                retry_base_secs: crate::core::types::defaults::sync_retry_base_secs(),
                connection_deadline: Duration::from_secs_f64(config.network.connection_deadline),
            },
            metrics.clone(),
        );

        for seed in &config.peers {
            if let Some((host, port)) = seed.rsplit_once(':') {
                if let Ok(port) = port.parse::<u16>() {
                    let (peer, is_new) =
                        registry.observe(seed, host, port, now_secs(), String::new(), NodeStats::default());
                    if is_new {
                        let replication = replication.clone();
                        tokio::spawn(async move {
                            replication.handle_liveness_event(LivenessEvent::BecameAlive(peer)).await;
                        });
                    }
                }
            } else {
                warn!(seed = %seed, "ignoring malformed static peer seed");
            }
        }

        let commands = CommandHandler::new(
            metadata.clone(),
            local.clone(),
            replication.clone(),
            node_id.clone(),
            metrics.clone(),
        );
        let router = Router::new(
            commands,
            replication.clone(),
            registry.clone(),
            node_id.clone(),
            config.network.max_frame_bytes,
            config.network.connection_deadline,
            metrics.clone(),
        );
        tasks.push(tokio::spawn(router.run(tcp_listener, shutdown_rx.clone())));

        if config.network.discovery_enabled {
            let socket = Arc::new(
                discovery::bind(&config.network.bind_address, config.network.discovery_port).await?,
            );
            tasks.push(tokio::spawn(discovery::run_announcer(
                socket.clone(),
                node_id.clone(),
                config.network.tcp_port,
                config.network.discovery_port,
                crate::core::types::defaults::discovery_interval(),
                shutdown_rx.clone(),
            )));
            tasks.push(tokio::spawn(discovery::run_listener(
                socket,
                node_id.clone(),
                registry.clone(),
                replication.clone(),
                shutdown_rx.clone(),
            )));
        }

        let (liveness_tx, mut liveness_rx) = tokio::sync::mpsc::channel(64);
        let heartbeat = Arc::new(HeartbeatService::new(
            registry.clone(),
            node_id.clone(),
            crate::core::types::defaults::heartbeat_failure_threshold(),
            config.network.connection_deadline,
            liveness_tx,
            metrics.clone(),
        ));
        {
            let heartbeat = heartbeat.clone();
            let metadata_for_stats = metadata.clone();
            let interval = config.network.heartbeat_interval;
            let hb_shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                heartbeat
                    .run(
                        interval,
                        || metadata_for_stats.stats().unwrap_or_default(),
                        hb_shutdown,
                    )
                    .await;
            }));
        }
        {
            let replication = replication.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = liveness_rx.recv().await {
                    replication.handle_liveness_event(event).await;
                }
            }));
        }

        tasks.push(tokio::spawn(replication.clone().run_periodic_resync(
            config.sync.resync_interval,
            shutdown_rx.clone(),
        )));

        {
            let metadata = metadata.clone();
            let mut vacuum_shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs_f64(
                    crate::core::types::defaults::vacuum_interval(),
                ));
                ticker.tick().await; // first tick fires immediately; skip it
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = metadata.vacuum().await {
                                warn!(error = %e, "periodic vacuum failed");
                            }
                        }
                        _ = vacuum_shutdown.changed() => {
                            if *vacuum_shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }));
        }

        if let Some(addr) = config.network.metrics_listen_addr.clone() {
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = crate::monitoring::http::serve(&addr, metrics, shutdown).await {
                    warn!(error = %e, "metrics endpoint exited");
                }
            }));
        }

        if !config.peers.is_empty() {
            let seeds = config.peers.clone();
            let registry = registry.clone();
            let replication = replication.clone();
            let reconnect_timeout = config.network.reconnect_timeout;
            let mut reseed_shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs_f64(reconnect_timeout.max(1.0)));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if registry.alive_snapshot().is_empty() {
                                for seed in &seeds {
                                    if let Some((host, port)) = seed.rsplit_once(':') {
                                        if let Ok(port) = port.parse::<u16>() {
                                            let (peer, is_new) = registry.observe(seed, host, port, now_secs(), String::new(), NodeStats::default());
                                            if is_new {
                                                let replication = replication.clone();
                                                tokio::spawn(async move {
                                                    replication.handle_liveness_event(LivenessEvent::BecameAlive(peer)).await;
                                                });
                                            }
                                        }
                                    }
                                }
                            }
                        }
                        _ = reseed_shutdown.changed() => {
                            if *reseed_shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }));
        }

        if config.filesystem.sync_on_startup {
            let replication = replication.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                for peer in registry.snapshot() {
                    if let Err(e) = replication.reconcile_with_peer(&peer).await {
                        warn!(peer = %peer.node_id, error = %e, "startup reconciliation failed");
                    }
                }
            });
        }

        info!(node = %node_id, "daemon ready");

        Ok(Self {
            node_id,
            metadata,
            registry,
            shutdown_tx,
            shutdown_rx,
            tasks,
        })
    }

    /// Block until an interrupt/terminate signal arrives, then shut down.
    pub async fn run_until_signal(mut self) {
        let _ = self.shutdown_rx.has_changed();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt, shutting down");
            }
            _ = terminate_signal() => {
                info!("received terminate, shutting down");
            }
        }
        self.shutdown().await;
    }

    /// Broadcast cancellation to every worker and wait up to a bounded grace
    /// period for them to drain (spec §4.8, §5).
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let drain = futures::future::join_all(self.tasks);
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("shutdown grace period elapsed with tasks still running");
        }
        if let Err(e) = self.metadata.vacuum().await {
            warn!(error = %e, "vacuum on shutdown failed");
        }
        info!(node = %self.node_id, peers = self.registry.len(), "daemon stopped");
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await
}
