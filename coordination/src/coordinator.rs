use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::registry::{CreateMode, Registry, Session, SessionEvent};
use crate::{
    CoordinationError, Result, CONFIG_PATH, LEADER_PATH, MESSAGES_PATH, NODES_PATH, ROOT_PATH,
};

const CANDIDATE_PREFIX: &str = "/messaging-system/leader/node-";

/// Coordination-service client for one node: registers liveness under
/// `/nodes`, runs the smallest-sequence election under `/leader` with the
/// watch-predecessor pattern, and offers a persistent write surface for
/// leader-only message metadata.
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    node_id: String,
    registry: Registry,
    session: Mutex<Option<Session>>,
    election: Mutex<ElectionState>,
    is_leader: AtomicBool,
    current_leader: Mutex<Option<String>>,
    /// The leader latch is signaled at most once per process lifetime:
    /// callers only block on initial leadership discovery.
    leader_signaled: AtomicBool,
    leader_tx: watch::Sender<bool>,
    leader_rx: watch::Receiver<bool>,
}

#[derive(Default)]
struct ElectionState {
    candidate_path: Option<String>,
    node_path: Option<String>,
    predecessor_path: Option<String>,
}

impl Coordinator {
    pub fn new(node_id: impl Into<String>, registry: Registry) -> Self {
        let (leader_tx, leader_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                node_id: node_id.into(),
                registry,
                session: Mutex::new(None),
                election: Mutex::new(ElectionState::default()),
                is_leader: AtomicBool::new(false),
                current_leader: Mutex::new(None),
                leader_signaled: AtomicBool::new(false),
                leader_tx,
                leader_rx,
            }),
        }
    }

    /// Opens a session, creates the base paths, registers this node, and
    /// enters the election. Must run inside a tokio runtime (the session
    /// event loop is spawned here).
    pub fn connect(&self) -> Result<()> {
        info!(node = %self.inner.node_id, "connecting to coordination service");

        let mut session = self.inner.registry.start_session();
        let events = session
            .take_events()
            .ok_or(CoordinationError::NotConnected)?;

        self.inner.initialize_paths(&session)?;
        self.inner.register_node(&session)?;
        self.inner.enter_election(&session)?;
        *lock(&self.inner.session) = Some(session);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_event_loop(events).await;
        });

        info!(node = %self.inner.node_id, "connected to coordination service");
        Ok(())
    }

    /// Blocks until the initial election produced an authoritative leader,
    /// whether self or another. Returns immediately on later calls.
    pub async fn wait_for_leadership(&self) {
        let mut rx = self.inner.leader_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn is_leader(&self) -> bool {
        self.inner.is_leader.load(Ordering::SeqCst)
    }

    pub fn current_leader(&self) -> Option<String> {
        lock(&self.inner.current_leader).clone()
    }

    /// Snapshot of currently-registered node ids; empty on any failure.
    pub fn live_nodes(&self) -> Vec<String> {
        match self.inner.with_session(|session| session.get_children(NODES_PATH)) {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "failed to list live nodes");
                Vec::new()
            }
        }
    }

    /// Persists message metadata under `/messages/<id>`. Leader-only:
    /// from a follower this is a silent skip; a duplicate id is a benign
    /// no-op. Never surfaces an error to the caller.
    pub fn store_message_metadata(&self, message_id: &str, metadata: &str) {
        if !self.is_leader() {
            debug!(message = message_id, "not leader, skipping metadata storage");
            return;
        }

        let path = format!("{MESSAGES_PATH}/{message_id}");
        let result = self.inner.with_session(|session| {
            session.create(&path, metadata.as_bytes(), CreateMode::Persistent)
        });
        match result {
            Ok(_) => info!(message = message_id, "stored message metadata"),
            Err(CoordinationError::NodeExists(_)) => {
                debug!(message = message_id, "message metadata already exists");
            }
            Err(e) => error!(message = message_id, error = %e, "failed to store message metadata"),
        }
    }

    pub fn session_id(&self) -> Option<crate::SessionId> {
        lock(&self.inner.session).as_ref().map(Session::id)
    }

    /// Best-effort delete of owned ephemerals, then session close.
    pub fn close(&self) {
        let session = lock(&self.inner.session).take();
        if let Some(session) = session {
            let (candidate, node_path) = {
                let mut election = lock(&self.inner.election);
                (election.candidate_path.take(), election.node_path.take())
            };
            if let Some(path) = candidate {
                let _ = session.delete(&path);
            }
            if let Some(path) = node_path {
                let _ = session.delete(&path);
            }
            session.close();
            info!(node = %self.inner.node_id, "disconnected from coordination service");
        }
    }
}

impl Inner {
    async fn run_event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        loop {
            let Some(event) = events.recv().await else {
                break;
            };
            match event {
                SessionEvent::NodeDeleted(path) => {
                    let watched = lock(&self.election).predecessor_path.clone();
                    if watched.as_deref() == Some(path.as_str()) {
                        // Our predecessor vanished; we may now be the leader.
                        if let Err(e) = self.reevaluate() {
                            error!(error = %e, "error while re-evaluating leadership");
                        }
                    }
                }
                SessionEvent::Expired => {
                    warn!(node = %self.node_id, "session expired, reconnecting and re-registering");
                    match self.reinitialize() {
                        Ok(new_events) => events = new_events,
                        Err(e) => {
                            error!(error = %e, "reconnect failed");
                            break;
                        }
                    }
                }
                SessionEvent::NodeCreated(_) => {}
            }
        }
    }

    fn initialize_paths(&self, session: &Session) -> Result<()> {
        for path in [ROOT_PATH, NODES_PATH, LEADER_PATH, MESSAGES_PATH, CONFIG_PATH] {
            match session.create(path, &[], CreateMode::Persistent) {
                Ok(_) => debug!(%path, "created coordination path"),
                Err(CoordinationError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn register_node(&self, session: &Session) -> Result<()> {
        let path = format!("{NODES_PATH}/{}", self.node_id);
        let registered = match session.create(&path, self.node_id.as_bytes(), CreateMode::Ephemeral)
        {
            Ok(path) => path,
            Err(CoordinationError::NodeExists(_)) => {
                // Stale ephemeral from a previous session: replace it.
                info!(%path, "node already registered, replacing");
                let _ = session.delete(&path);
                session.create(&path, self.node_id.as_bytes(), CreateMode::Ephemeral)?
            }
            Err(e) => return Err(e),
        };
        info!(path = %registered, "registered node");
        lock(&self.election).node_path = Some(registered);
        Ok(())
    }

    fn enter_election(&self, session: &Session) -> Result<()> {
        info!(node = %self.node_id, "starting leader election");
        let candidate = session.create(
            CANDIDATE_PREFIX,
            self.node_id.as_bytes(),
            CreateMode::EphemeralSequential,
        )?;
        info!(candidate = %candidate, "created leader candidate");
        lock(&self.election).candidate_path = Some(candidate);
        self.evaluate_leadership(session)
    }

    /// Checks whether our candidate is the smallest under `/leader`; if
    /// not, watches the immediate predecessor only, so exactly one node
    /// re-evaluates per departure.
    fn evaluate_leadership(&self, session: &Session) -> Result<()> {
        loop {
            let children = session.get_children(LEADER_PATH)?;
            if children.is_empty() {
                return Ok(());
            }

            let Some(candidate) = lock(&self.election).candidate_path.clone() else {
                return Ok(());
            };
            let my_name = match candidate.rsplit_once('/') {
                Some((_, name)) => name.to_string(),
                None => candidate.clone(),
            };

            let Some(index) = children.iter().position(|child| *child == my_name) else {
                // Our candidate vanished (session hiccup): rejoin.
                warn!(node = %self.node_id, "candidate missing from election, rejoining");
                let candidate = session.create(
                    CANDIDATE_PREFIX,
                    self.node_id.as_bytes(),
                    CreateMode::EphemeralSequential,
                )?;
                lock(&self.election).candidate_path = Some(candidate);
                continue;
            };

            if index == 0 {
                self.become_leader();
                return Ok(());
            }

            let predecessor = format!("{LEADER_PATH}/{}", children[index - 1]);
            if !session.watch_exists(&predecessor)? {
                // Predecessor vanished between listing and watching.
                continue;
            }
            lock(&self.election).predecessor_path = Some(predecessor);

            let leader_path = format!("{LEADER_PATH}/{}", children[0]);
            let leader = session
                .get_data(&leader_path)?
                .map(|data| String::from_utf8_lossy(&data).into_owned());
            *lock(&self.current_leader) = leader;
            self.become_follower();
            return Ok(());
        }
    }

    fn reevaluate(&self) -> Result<()> {
        self.with_session(|session| self.evaluate_leadership(session))
    }

    /// Full re-init after expiry: fresh session, base paths, registration,
    /// election. The leader latch stays released.
    fn reinitialize(&self) -> Result<mpsc::UnboundedReceiver<SessionEvent>> {
        if let Some(old) = lock(&self.session).take() {
            old.close();
        }
        {
            let mut election = lock(&self.election);
            *election = ElectionState::default();
        }

        let mut session = self.registry.start_session();
        let events = session
            .take_events()
            .ok_or(CoordinationError::NotConnected)?;

        self.initialize_paths(&session)?;
        self.register_node(&session)?;
        self.enter_election(&session)?;
        *lock(&self.session) = Some(session);
        Ok(events)
    }

    fn become_leader(&self) {
        self.is_leader.store(true, Ordering::SeqCst);
        *lock(&self.current_leader) = Some(self.node_id.clone());
        lock(&self.election).predecessor_path = None;
        info!(node = %self.node_id, "elected leader");
        self.signal_leadership();
    }

    fn become_follower(&self) {
        if self.is_leader.swap(false, Ordering::SeqCst) {
            info!(node = %self.node_id, "lost leadership, now follower");
        }
        self.signal_leadership();
        info!(
            node = %self.node_id,
            leader = lock(&self.current_leader).as_deref().unwrap_or("unknown"),
            "following leader"
        );
    }

    fn signal_leadership(&self) {
        if self
            .leader_signaled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.leader_tx.send(true);
        }
    }

    fn with_session<T>(&self, op: impl FnOnce(&Session) -> Result<T>) -> Result<T> {
        let guard = lock(&self.session);
        match guard.as_ref() {
            Some(session) => op(session),
            None => Err(CoordinationError::NotConnected),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within deadline");
    }

    fn cluster(registry: &Registry, size: usize) -> Vec<Coordinator> {
        (1..=size)
            .map(|k| {
                let coordinator = Coordinator::new(format!("node-{k}"), registry.clone());
                coordinator.connect().unwrap();
                coordinator
            })
            .collect()
    }

    #[tokio::test]
    async fn smallest_candidate_wins_the_election() {
        let registry = Registry::new();
        let nodes = cluster(&registry, 3);

        for node in &nodes {
            node.wait_for_leadership().await;
        }

        assert!(nodes[0].is_leader());
        assert!(!nodes[1].is_leader());
        assert!(!nodes[2].is_leader());
        for node in &nodes {
            assert_eq!(node.current_leader().as_deref(), Some("node-1"));
        }
        let leaders = nodes.iter().filter(|n| n.is_leader()).count();
        assert_eq!(leaders, 1);
    }

    #[tokio::test]
    async fn live_nodes_tracks_registrations() {
        let registry = Registry::new();
        let nodes = cluster(&registry, 3);

        assert_eq!(
            nodes[0].live_nodes(),
            vec!["node-1".to_string(), "node-2".to_string(), "node-3".to_string()]
        );

        nodes[2].close();
        assert_eq!(
            nodes[0].live_nodes(),
            vec!["node-1".to_string(), "node-2".to_string()]
        );
    }

    #[tokio::test]
    async fn predecessor_departure_promotes_the_next_candidate() {
        let registry = Registry::new();
        let nodes = cluster(&registry, 3);
        nodes[0].wait_for_leadership().await;
        assert!(nodes[0].is_leader());

        nodes[0].close();

        wait_until(|| nodes[1].is_leader()).await;
        assert!(!nodes[2].is_leader());
        assert_eq!(nodes[1].current_leader().as_deref(), Some("node-2"));
    }

    #[tokio::test]
    async fn middle_departure_does_not_disturb_the_leader() {
        let registry = Registry::new();
        let nodes = cluster(&registry, 3);

        nodes[1].close();
        // node-3 re-watches node-1's candidate; leadership is unchanged.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(nodes[0].is_leader());
        assert!(!nodes[2].is_leader());

        nodes[0].close();
        wait_until(|| nodes[2].is_leader()).await;
    }

    #[tokio::test]
    async fn session_expiry_triggers_reelection_and_reregistration() {
        let registry = Registry::new();
        let nodes = cluster(&registry, 2);
        nodes[0].wait_for_leadership().await;
        assert!(nodes[0].is_leader());

        let session = nodes[0].session_id().unwrap();
        registry.expire_session(session);

        // The old leader rejoins behind node-2.
        wait_until(|| nodes[1].is_leader()).await;
        wait_until(|| !nodes[0].is_leader()).await;
        wait_until(|| nodes[0].current_leader().as_deref() == Some("node-2")).await;
        assert!(nodes[0]
            .live_nodes()
            .contains(&"node-1".to_string()));

        // The latch was already released; this returns immediately.
        nodes[0].wait_for_leadership().await;
    }

    #[tokio::test]
    async fn metadata_writes_are_leader_only_and_idempotent() {
        let registry = Registry::new();
        let nodes = cluster(&registry, 2);
        nodes[0].wait_for_leadership().await;

        nodes[0].store_message_metadata("m1", "a->b:123");
        nodes[0].store_message_metadata("m1", "a->b:123");
        nodes[1].store_message_metadata("m2", "b->a:456");

        let session = registry.start_session();
        let stored = session.get_children(MESSAGES_PATH).unwrap();
        assert_eq!(stored, vec!["m1".to_string()]);
        assert_eq!(
            session.get_data("/messaging-system/messages/m1").unwrap(),
            Some(b"a->b:123".to_vec())
        );
    }
}
