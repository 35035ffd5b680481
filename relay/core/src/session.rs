//! Session Registry - Live Tunnel Tracking
//!
//! Every open tunnel registers a [`Session`] for as long as its client stays
//! connected. The relay's dispatch task reads the registry on every message
//! to find who should receive it.
//!
//! # Architecture
//!
//! ```text
//!                      SessionRegistry
//!                     ┌──────────────────────────────────┐
//!                     │ HashMap<SessionId, Session>      │
//!                     │   - wrapped in Arc<RwLock<>>     │
//!                     └───────────────┬──────────────────┘
//!                                     │  list() snapshot
//!              ┌──────────────────────┼──────────────────────┐
//!              │                      │                      │
//!       ┌──────▼──────┐       ┌───────▼──────┐       ┌───────▼──────┐
//!       │  kiosk-1    │       │  phone-app   │       │   browser    │
//!       │  session A  │       │  session B   │       │  session C   │
//!       └─────────────┘       └──────────────┘       └──────────────┘
//! ```
//!
//! # Thread Safety
//!
//! Reads (one per dispatched message) are far more frequent than writes (one
//! pair per connection), so the map sits behind a reader/writer lock. No
//! operation holds the lock across an await point; [`SessionRegistry::list`]
//! returns a copy so sends happen with the lock released.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::transport::TunnelStream;

/// Unique identifier for a tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered tunnel
///
/// Cheap to clone: the stream is shared, not duplicated.
#[derive(Clone)]
pub struct Session {
    /// Unique session identifier
    pub id: SessionId,
    /// When the tunnel was opened
    pub started_at: DateTime<Utc>,
    /// Outbound stream to the client
    pub stream: Arc<dyn TunnelStream>,
}

impl Session {
    /// Create a session with a fresh id, started now
    #[must_use]
    pub fn new(stream: Arc<dyn TunnelStream>) -> Self {
        Self::with_id(SessionId::new(), stream)
    }

    /// Create a session with a caller-chosen id
    #[must_use]
    pub fn with_id(id: SessionId, stream: Arc<dyn TunnelStream>) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            stream,
        }
    }

    /// Time since the tunnel was opened
    #[must_use]
    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

/// Registry lookup errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No session with this id is registered
    #[error("Session not found: {0}")]
    NotFound(SessionId),
}

/// Concurrency-safe map of live sessions
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<SessionId, Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session
    ///
    /// An existing entry with the same id is replaced.
    pub fn add(&self, session: Session) {
        let id = session.id;
        let replaced = self.inner.write().insert(id, session).is_some();
        if replaced {
            tracing::warn!(session_id = %id, "Session replaced existing entry");
        } else {
            tracing::info!(session_id = %id, "Session registered");
        }
    }

    /// Deregister a session, returning it
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NotFound` if the id is not registered.
    pub fn remove(&self, id: &SessionId) -> Result<Session, RegistryError> {
        let session = self
            .inner
            .write()
            .remove(id)
            .ok_or(RegistryError::NotFound(*id))?;

        tracing::info!(
            session_id = %id,
            uptime_ms = session.uptime().num_milliseconds(),
            "Session removed"
        );
        Ok(session)
    }

    /// Look up a session
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NotFound` if the id is not registered.
    pub fn find_by_id(&self, id: &SessionId) -> Result<Session, RegistryError> {
        self.inner
            .read()
            .get(id)
            .cloned()
            .ok_or(RegistryError::NotFound(*id))
    }

    /// Snapshot of every registered session
    ///
    /// Later adds and removes do not affect the returned vector.
    #[must_use]
    pub fn list(&self) -> Vec<Session> {
        self.inner.read().values().cloned().collect()
    }

    /// Number of registered sessions
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    /// Check whether a session is registered
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.inner.read().contains_key(id)
    }

    /// Ids of every registered session
    #[must_use]
    pub fn ids(&self) -> Vec<SessionId> {
        self.inner.read().keys().copied().collect()
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InProcessStream;
    use rand::seq::SliceRandom;
    use std::collections::HashSet;
    use tokio::task::JoinSet;

    fn session() -> Session {
        let (stream, _client) = InProcessStream::new_pair(1);
        Session::new(Arc::new(stream))
    }

    #[test]
    fn test_add_and_find() {
        let registry = SessionRegistry::new();
        let s = session();
        let id = s.id;

        registry.add(s);

        assert!(registry.contains(&id));
        assert_eq!(registry.find_by_id(&id).unwrap().id, id);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_remove_returns_session() {
        let registry = SessionRegistry::new();
        let s = session();
        let id = s.id;
        registry.add(s);

        let removed = registry.remove(&id).unwrap();
        assert_eq!(removed.id, id);
        assert!(!registry.contains(&id));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_remove_unknown_is_not_found() {
        let registry = SessionRegistry::new();
        let id = SessionId::new();

        assert_eq!(registry.remove(&id).unwrap_err(), RegistryError::NotFound(id));
    }

    #[test]
    fn test_double_remove_is_not_found() {
        let registry = SessionRegistry::new();
        let s = session();
        let id = s.id;
        registry.add(s);

        registry.remove(&id).unwrap();
        assert!(matches!(registry.remove(&id), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_find_unknown_is_not_found() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.find_by_id(&SessionId::new()),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_add_same_id_replaces() {
        let registry = SessionRegistry::new();
        let first = session();
        let id = first.id;
        let started = first.started_at;
        registry.add(first);

        let (stream, _client) = InProcessStream::new_pair(1);
        let mut second = Session::with_id(id, Arc::new(stream));
        second.started_at = started + chrono::Duration::seconds(5);
        registry.add(second);

        assert_eq!(registry.count(), 1);
        assert_eq!(
            registry.find_by_id(&id).unwrap().started_at,
            started + chrono::Duration::seconds(5)
        );
    }

    #[test]
    fn test_list_is_a_snapshot() {
        let registry = SessionRegistry::new();
        let a = session();
        let a_id = a.id;
        registry.add(a);
        registry.add(session());

        let snapshot = registry.list();

        registry.remove(&a_id).unwrap();
        registry.add(session());
        registry.add(session());

        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().any(|s| s.id == a_id));
        assert_eq!(registry.count(), 3);
    }

    #[test]
    fn test_ids_match_registered() {
        let registry = SessionRegistry::new();
        let expected: HashSet<SessionId> = (0..5)
            .map(|_| {
                let s = session();
                let id = s.id;
                registry.add(s);
                id
            })
            .collect();

        let ids: HashSet<SessionId> = registry.ids().into_iter().collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let ids: HashSet<SessionId> = (0..1000).map(|_| SessionId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_remove_leaves_registry_empty() {
        const N: usize = 200;

        let registry = SessionRegistry::new();
        let sessions: Vec<Session> = (0..N).map(|_| session()).collect();

        // Every id is added once and removed once, in a random interleaving.
        // A remove may run before its add; it retries until the add lands.
        let mut ops: Vec<(bool, Session)> = sessions
            .iter()
            .flat_map(|s| [(true, s.clone()), (false, s.clone())])
            .collect();
        ops.shuffle(&mut rand::thread_rng());

        let mut tasks = JoinSet::new();
        for (is_add, s) in ops {
            let registry = registry.clone();
            tasks.spawn(async move {
                if is_add {
                    registry.add(s);
                } else {
                    while registry.remove(&s.id).is_err() {
                        tokio::task::yield_now().await;
                    }
                }
                // Readers run alongside writers
                let _ = registry.list();
            });
        }

        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }

        assert_eq!(registry.count(), 0);
        assert!(registry.list().is_empty());
    }
}
