use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::debug;

use crate::{CoordinationError, Result};

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    /// Ephemeral with a monotonically increasing 8-digit suffix assigned
    /// by the parent at creation.
    EphemeralSequential,
}

/// Events delivered on a session's channel: one-shot watch notifications
/// plus session expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    NodeCreated(String),
    NodeDeleted(String),
    Expired,
}

/// In-process hierarchical coordination service. All nodes of a cluster
/// share one handle; znodes live under absolute slash-separated paths,
/// ephemerals are tied to the creating session, and existence watches
/// fire once over the watching session's event channel.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    tree: BTreeMap<String, Znode>,
    sessions: HashMap<SessionId, SessionState>,
    watches: HashMap<String, Vec<SessionId>>,
    next_session: SessionId,
}

struct Znode {
    data: Vec<u8>,
    owner: Option<SessionId>,
    next_sequence: u64,
}

struct SessionState {
    events: mpsc::UnboundedSender<SessionEvent>,
}

/// A client session. Operations fail with `SessionExpired` once the
/// session has been closed or expired.
pub struct Session {
    id: SessionId,
    registry: Registry,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_session(&self) -> Session {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.lock();
            state.next_session += 1;
            let id = state.next_session;
            state.sessions.insert(id, SessionState { events: tx });
            id
        };
        debug!(session = id, "coordination session opened");
        Session {
            id,
            registry: self.clone(),
            events: Some(rx),
        }
    }

    /// Simulates a session timeout: the owner receives `Expired` and its
    /// ephemerals vanish, firing watches exactly as on a normal close.
    pub fn expire_session(&self, session: SessionId) {
        let mut state = self.lock();
        if let Some(session_state) = state.sessions.get(&session) {
            let _ = session_state.events.send(SessionEvent::Expired);
        }
        Self::teardown_session(&mut state, session);
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn create(
        &self,
        session: SessionId,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String> {
        let mut state = self.lock();
        state.check_session(session)?;

        if !path.starts_with('/') || path.len() < 2 {
            return Err(CoordinationError::InvalidPath(path.to_string()));
        }
        let (parent, _) = path
            .rsplit_once('/')
            .ok_or_else(|| CoordinationError::InvalidPath(path.to_string()))?;
        if !parent.is_empty() && !state.tree.contains_key(parent) {
            return Err(CoordinationError::NoNode(parent.to_string()));
        }

        let actual_path = match mode {
            CreateMode::EphemeralSequential => {
                let parent_node = state
                    .tree
                    .get_mut(parent)
                    .ok_or_else(|| CoordinationError::NoNode(parent.to_string()))?;
                parent_node.next_sequence += 1;
                format!("{path}{:08}", parent_node.next_sequence)
            }
            _ => path.to_string(),
        };

        if state.tree.contains_key(&actual_path) {
            return Err(CoordinationError::NodeExists(actual_path));
        }

        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral | CreateMode::EphemeralSequential => Some(session),
        };
        state.tree.insert(
            actual_path.clone(),
            Znode {
                data: data.to_vec(),
                owner,
                next_sequence: 0,
            },
        );
        state.notify_watchers(&actual_path, SessionEvent::NodeCreated(actual_path.clone()));
        debug!(path = %actual_path, "created znode");
        Ok(actual_path)
    }

    fn delete(&self, session: SessionId, path: &str) -> Result<()> {
        let mut state = self.lock();
        state.check_session(session)?;

        if !state.tree.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        if state.has_children(path) {
            return Err(CoordinationError::NotEmpty(path.to_string()));
        }
        state.tree.remove(path);
        state.notify_watchers(path, SessionEvent::NodeDeleted(path.to_string()));
        debug!(%path, "deleted znode");
        Ok(())
    }

    fn exists(&self, session: SessionId, path: &str, watch: bool) -> Result<bool> {
        let mut state = self.lock();
        state.check_session(session)?;
        if watch {
            state
                .watches
                .entry(path.to_string())
                .or_default()
                .push(session);
        }
        Ok(state.tree.contains_key(path))
    }

    fn get_data(&self, session: SessionId, path: &str) -> Result<Option<Vec<u8>>> {
        let state = self.lock();
        state.check_session(session)?;
        Ok(state.tree.get(path).map(|node| node.data.clone()))
    }

    fn get_children(&self, session: SessionId, path: &str) -> Result<Vec<String>> {
        let state = self.lock();
        state.check_session(session)?;
        let prefix = format!("{path}/");
        Ok(state
            .tree
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let name = &key[prefix.len()..];
                (!name.contains('/')).then(|| name.to_string())
            })
            .collect())
    }

    fn close_session(&self, session: SessionId) {
        let mut state = self.lock();
        Self::teardown_session(&mut state, session);
        debug!(session, "coordination session closed");
    }

    fn teardown_session(state: &mut RegistryState, session: SessionId) {
        state.sessions.remove(&session);

        let ephemerals: Vec<String> = state
            .tree
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in ephemerals {
            state.tree.remove(&path);
            state.notify_watchers(&path, SessionEvent::NodeDeleted(path.clone()));
        }

        for watchers in state.watches.values_mut() {
            watchers.retain(|watcher| *watcher != session);
        }
    }
}

impl RegistryState {
    fn check_session(&self, session: SessionId) -> Result<()> {
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(CoordinationError::SessionExpired)
        }
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{path}/");
        self.tree
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .next()
            .is_some()
    }

    /// One-shot: registered watchers on the path are notified and removed.
    fn notify_watchers(&mut self, path: &str, event: SessionEvent) {
        if let Some(watchers) = self.watches.remove(path) {
            for watcher in watchers {
                if let Some(session) = self.sessions.get(&watcher) {
                    let _ = session.events.send(event.clone());
                }
            }
        }
    }
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Hands the event channel to the caller's event loop. Yields `None`
    /// after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }

    pub fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.registry.create(self.id, path, data, mode)
    }

    pub fn delete(&self, path: &str) -> Result<()> {
        self.registry.delete(self.id, path)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        self.registry.exists(self.id, path, false)
    }

    /// Current existence of the path, registering a one-shot watch that
    /// fires on the next create or delete of it.
    pub fn watch_exists(&self, path: &str) -> Result<bool> {
        self.registry.exists(self.id, path, true)
    }

    pub fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.registry.get_data(self.id, path)
    }

    /// Direct children names of a path, sorted.
    pub fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.registry.get_children(self.id, path)
    }

    pub fn close(&self) {
        self.registry.close_session(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_and_reads_nodes() {
        let registry = Registry::new();
        let session = registry.start_session();

        session.create("/app", b"", CreateMode::Persistent).unwrap();
        session
            .create("/app/config", b"payload", CreateMode::Persistent)
            .unwrap();

        assert!(session.exists("/app/config").unwrap());
        assert_eq!(
            session.get_data("/app/config").unwrap(),
            Some(b"payload".to_vec())
        );
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let registry = Registry::new();
        let session = registry.start_session();
        session.create("/app", b"", CreateMode::Persistent).unwrap();
        assert!(matches!(
            session.create("/app", b"", CreateMode::Persistent),
            Err(CoordinationError::NodeExists(_))
        ));
    }

    #[test]
    fn create_requires_an_existing_parent() {
        let registry = Registry::new();
        let session = registry.start_session();
        assert!(matches!(
            session.create("/app/deep", b"", CreateMode::Persistent),
            Err(CoordinationError::NoNode(_))
        ));
    }

    #[test]
    fn sequential_children_get_increasing_suffixes() {
        let registry = Registry::new();
        let session = registry.start_session();
        session.create("/leader", b"", CreateMode::Persistent).unwrap();

        let first = session
            .create("/leader/node-", b"a", CreateMode::EphemeralSequential)
            .unwrap();
        let second = session
            .create("/leader/node-", b"b", CreateMode::EphemeralSequential)
            .unwrap();

        assert_eq!(first, "/leader/node-00000001");
        assert_eq!(second, "/leader/node-00000002");
        assert_eq!(
            session.get_children("/leader").unwrap(),
            vec!["node-00000001".to_string(), "node-00000002".to_string()]
        );
    }

    #[test]
    fn children_are_sorted_and_direct_only() {
        let registry = Registry::new();
        let session = registry.start_session();
        session.create("/app", b"", CreateMode::Persistent).unwrap();
        session.create("/app/b", b"", CreateMode::Persistent).unwrap();
        session.create("/app/a", b"", CreateMode::Persistent).unwrap();
        session.create("/app/a/nested", b"", CreateMode::Persistent).unwrap();

        assert_eq!(
            session.get_children("/app").unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn delete_rejects_non_empty_nodes() {
        let registry = Registry::new();
        let session = registry.start_session();
        session.create("/app", b"", CreateMode::Persistent).unwrap();
        session.create("/app/a", b"", CreateMode::Persistent).unwrap();

        assert!(matches!(
            session.delete("/app"),
            Err(CoordinationError::NotEmpty(_))
        ));
        session.delete("/app/a").unwrap();
        session.delete("/app").unwrap();
    }

    #[tokio::test]
    async fn closing_a_session_removes_its_ephemerals_and_fires_watches() {
        let registry = Registry::new();
        let mut owner = registry.start_session();
        let mut watcher = registry.start_session();

        owner.create("/app", b"", CreateMode::Persistent).unwrap();
        owner
            .create("/app/worker", b"", CreateMode::Ephemeral)
            .unwrap();
        assert!(watcher.watch_exists("/app/worker").unwrap());

        owner.close();
        let _ = owner.take_events();

        let mut events = watcher.take_events().unwrap();
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::NodeDeleted("/app/worker".to_string()))
        );
        assert!(!watcher.exists("/app/worker").unwrap());
    }

    #[tokio::test]
    async fn watches_fire_once() {
        let registry = Registry::new();
        let owner = registry.start_session();
        let mut watcher = registry.start_session();

        owner.create("/app", b"", CreateMode::Persistent).unwrap();
        owner.create("/app/a", b"", CreateMode::Persistent).unwrap();
        assert!(watcher.watch_exists("/app/a").unwrap());

        owner.delete("/app/a").unwrap();
        // Re-create without a fresh watch: no second event.
        owner.create("/app/a", b"", CreateMode::Persistent).unwrap();
        owner.delete("/app/a").unwrap();

        let mut events = watcher.take_events().unwrap();
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::NodeDeleted("/app/a".to_string()))
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn expiry_notifies_the_owner_and_invalidates_the_session() {
        let registry = Registry::new();
        let mut session = registry.start_session();
        session.create("/app", b"", CreateMode::Persistent).unwrap();
        session.create("/app/me", b"", CreateMode::Ephemeral).unwrap();

        registry.expire_session(session.id());

        let mut events = session.take_events().unwrap();
        assert_eq!(events.recv().await, Some(SessionEvent::Expired));
        assert!(matches!(
            session.exists("/app/me"),
            Err(CoordinationError::SessionExpired)
        ));
    }

    #[test]
    fn persistent_nodes_survive_session_close() {
        let registry = Registry::new();
        let first = registry.start_session();
        first.create("/app", b"", CreateMode::Persistent).unwrap();
        first.close();

        let second = registry.start_session();
        assert!(second.exists("/app").unwrap());
    }
}
