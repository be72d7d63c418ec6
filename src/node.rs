use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use coordination::{Coordinator, Registry};
use detector::FailureDetector;
use replication::{QuorumReplicator, ReplicaProfile};
use timesync::{HybridClock, Message, Sequencer};
use transport::{InboundHandler, LineServer};

use crate::config::Config;
use crate::error::Result;
use crate::metrics::SystemMetrics;

/// One cluster node: the coordinator, failure detector, replication
/// engine, time service, sequencer, and transport server it exclusively
/// owns, wired per the configured cluster layout.
pub struct MessagingNode {
    inner: Arc<NodeInner>,
    server: LineServer,
}

struct NodeInner {
    config: Config,
    coordinator: Option<Coordinator>,
    detector: FailureDetector,
    replicator: QuorumReplicator,
    clock: HybridClock,
    sequencer: Sequencer,
    metrics: SystemMetrics,
    peers: RwLock<Vec<String>>,
    message_count: AtomicU64,
}

struct IngressHandler {
    node: Arc<NodeInner>,
}

#[async_trait]
impl InboundHandler for IngressHandler {
    async fn handle_line(&self, line: String) {
        self.node.handle_incoming(line).await;
    }
}

impl MessagingNode {
    /// A registry handle enables coordinated mode; `None` runs standalone
    /// with the configured static peers.
    pub fn new(config: Config, registry: Option<Registry>) -> Result<Self> {
        Self::with_profile(config, registry, ReplicaProfile::default())
    }

    pub fn with_profile(
        config: Config,
        registry: Option<Registry>,
        profile: ReplicaProfile,
    ) -> Result<Self> {
        info!(node = %config.node_id, "initializing node components");

        let coordinator =
            registry.map(|registry| Coordinator::new(config.node_id.clone(), registry));
        let replicator = QuorumReplicator::with_profile(config.total_replicas, profile)?;
        let detector = FailureDetector::new((&config).into());

        let inner = Arc::new(NodeInner {
            coordinator,
            detector,
            replicator,
            clock: HybridClock::new(),
            sequencer: Sequencer::new(),
            metrics: SystemMetrics::new(),
            peers: RwLock::new(config.peers.clone()),
            message_count: AtomicU64::new(0),
            config,
        });
        let server = LineServer::new(Arc::new(IngressHandler {
            node: inner.clone(),
        }));
        Ok(Self { inner, server })
    }

    pub async fn start(&self) -> Result<()> {
        info!(
            node = %self.inner.config.node_id,
            port = self.inner.config.port,
            "starting node"
        );

        if let Some(coordinator) = &self.inner.coordinator {
            let election_started = Instant::now();
            coordinator.connect()?;
            coordinator.wait_for_leadership().await;
            self.inner
                .metrics
                .record_election_duration(election_started.elapsed().as_millis() as u64);
            self.inner.refresh_peers_from_coordination();
        } else {
            warn!("running without coordination service, standalone mode");
        }

        self.server.start(self.inner.config.port).await?;

        let peers = self.inner.peer_snapshot();
        self.inner.detector.set_peers(peers.clone());
        self.inner.detector.start()?;

        if !peers.is_empty() {
            self.inner.clock.synchronize_clocks(&peers).await;
        }

        info!(
            node = %self.inner.config.node_id,
            role = self.role(),
            peers = peers.len(),
            "node started"
        );
        Ok(())
    }

    /// Client entry point: stamp, then process locally when leader (or
    /// standalone), otherwise route the content to the leader's port.
    pub async fn send_message(&self, receiver: &str, content: &str) -> Result<bool> {
        self.inner.send_message(receiver, content).await
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    pub fn role(&self) -> &'static str {
        match &self.inner.coordinator {
            Some(coordinator) if coordinator.is_leader() => "leader",
            Some(_) => "follower",
            None => "standalone",
        }
    }

    pub fn is_leader(&self) -> bool {
        self.inner
            .coordinator
            .as_ref()
            .is_some_and(Coordinator::is_leader)
    }

    pub fn current_leader(&self) -> Option<String> {
        self.inner
            .coordinator
            .as_ref()
            .and_then(Coordinator::current_leader)
    }

    pub fn live_nodes(&self) -> Vec<String> {
        self.inner
            .coordinator
            .as_ref()
            .map(Coordinator::live_nodes)
            .unwrap_or_default()
    }

    pub fn message_count(&self) -> u64 {
        self.inner.message_count.load(Ordering::Relaxed)
    }

    pub async fn stabilized_count(&self) -> usize {
        self.inner.replicator.stabilized_count().await
    }

    pub async fn read_message(&self, message_id: &str) -> Option<String> {
        self.inner.replicator.read_message(message_id).await
    }

    pub fn metrics(&self) -> &SystemMetrics {
        &self.inner.metrics
    }

    pub fn stop(&self) {
        info!(node = %self.inner.config.node_id, "stopping node");
        self.server.stop();
        if let Some(coordinator) = &self.inner.coordinator {
            coordinator.close();
        }
        self.inner.detector.stop();
        self.inner.replicator.shutdown();
        self.inner.metrics.log_summary();
        info!(node = %self.inner.config.node_id, "node stopped");
    }
}

impl NodeInner {
    fn peer_snapshot(&self) -> Vec<String> {
        match self.peers.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Derive peer addresses from the live-node set, mapping `node-<k>`
    /// to the conventional port.
    fn refresh_peers_from_coordination(&self) {
        let Some(coordinator) = &self.coordinator else {
            return;
        };

        let mut peers = Vec::new();
        for node in coordinator.live_nodes() {
            if node == self.config.node_id {
                continue;
            }
            match self.config.peer_address(&node) {
                Some(address) => peers.push(address),
                None => warn!(%node, "ignoring live node with invalid id"),
            }
        }

        info!(?peers, "updated peers from coordination service");
        match self.peers.write() {
            Ok(mut guard) => *guard = peers,
            Err(poisoned) => *poisoned.into_inner() = peers,
        }
    }

    /// Inbound transport line: wrap, stamp, and process as a message
    /// addressed to this node.
    async fn handle_incoming(&self, content: String) {
        let number = self.message_count.fetch_add(1, Ordering::Relaxed) + 1;

        let mut message = match Message::new("remote-user", &self.config.node_id, &content) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "rejected inbound message");
                return;
            }
        };
        message.set_physical_ts(self.clock.current_timestamp());
        message.set_logical_ts(self.clock.next_logical_time());

        info!(number, "received external message");

        let started = Instant::now();
        self.process_message(message).await;
        self.metrics
            .record_message_delivery(started.elapsed().as_millis() as u64);
    }

    async fn send_message(&self, receiver: &str, content: &str) -> Result<bool> {
        let mut message = Message::new(&self.config.node_id, receiver, content)?;
        message.set_physical_ts(self.clock.current_timestamp());
        message.set_logical_ts(self.clock.next_logical_time());

        info!(node = %self.config.node_id, to = %receiver, "sending message");
        let started = Instant::now();

        let accepted = match &self.coordinator {
            None => self.process_message(message).await,
            Some(coordinator) if coordinator.is_leader() => self.process_message(message).await,
            Some(coordinator) => {
                let leader = coordinator
                    .current_leader()
                    .filter(|leader| *leader != self.config.node_id);
                match leader {
                    Some(leader) => self.route_to_leader(&leader, message).await,
                    None => {
                        warn!("no leader available, processing locally");
                        self.process_message(message).await
                    }
                }
            }
        };

        self.metrics
            .record_message_delivery(started.elapsed().as_millis() as u64);
        Ok(accepted)
    }

    async fn route_to_leader(&self, leader: &str, message: Message) -> bool {
        let Some(port) = self.config.peer_port(leader) else {
            warn!(%leader, "invalid leader id, processing locally");
            return self.process_message(message).await;
        };

        if transport::send_message("127.0.0.1", port, message.content()).await {
            info!(%leader, port, "message routed to leader");
            true
        } else {
            warn!(%leader, "failed to route to leader, processing locally");
            self.process_message(message).await
        }
    }

    /// Replicate, record leader metadata, then sequence for delivery.
    async fn process_message(&self, message: Message) -> bool {
        debug!(message = message.short_id(), "processing message");

        let replication_started = Instant::now();
        let stored = self
            .replicator
            .write_message(message.id(), message.content())
            .await;
        self.metrics
            .record_replication_latency(replication_started.elapsed().as_millis() as u64);

        if !stored {
            warn!(message = message.short_id(), "failed to store message");
            return false;
        }

        if let Some(coordinator) = &self.coordinator {
            if coordinator.is_leader() {
                let metadata = format!(
                    "{}->{}:{}",
                    message.sender(),
                    message.receiver(),
                    message.physical_ts()
                );
                coordinator.store_message_metadata(message.id(), &metadata);
            }
        }

        let short_id = message.short_id().to_string();
        let delivered = self.sequencer.queue_message(message);
        debug!(
            message = %short_id,
            delivered = delivered.len(),
            "message processed and stored"
        );
        true
    }
}
