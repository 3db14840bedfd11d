//! Client sessions and the per-operation session context stamped onto outgoing commands.

#[cfg(test)]
mod test;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
        MutexGuard,
    },
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Document, Timestamp},
    error::{Error, Result},
};

/// Struct modeling a cluster time reported by the server.
#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTime {
    /// The time itself.
    pub cluster_time: Timestamp,

    /// The server's signature over the time.
    pub signature: Document,
}

impl Eq for ClusterTime {}

impl std::cmp::Ord for ClusterTime {
    fn cmp(&self, other: &ClusterTime) -> std::cmp::Ordering {
        self.cluster_time.cmp(&other.cluster_time)
    }
}

impl std::cmp::PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &ClusterTime) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A server-side logical session, recycled through a [`ServerSessionPool`].
#[derive(Clone, Debug)]
pub struct ServerSession {
    id: Document,
}

impl ServerSession {
    fn new() -> Self {
        let binary = Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        };

        Self {
            id: doc! { "id": binary },
        }
    }

    /// The `lsid` document identifying this session to the server.
    pub fn id(&self) -> &Document {
        &self.id
    }
}

/// A pool of server sessions shared by the client sessions of one deployment.
#[derive(Debug, Default)]
pub struct ServerSessionPool {
    pool: Mutex<VecDeque<ServerSession>>,
}

impl ServerSessionPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks out a server session, reusing the most recently returned one when available.
    pub fn check_out(&self) -> ServerSession {
        self.lock().pop_front().unwrap_or_else(ServerSession::new)
    }

    /// Returns a server session to the pool.
    pub fn check_in(&self, session: ServerSession) {
        self.lock().push_front(session);
    }

    /// The number of idle sessions in the pool.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the pool holds no idle sessions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ServerSession>> {
        self.pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A client session: the driver-side handle on a server session, tracking the operation and
/// cluster times observed through it.
///
/// A session is closed exactly once. Closing returns its server session to the pool it was
/// checked out from; closing it again is reported as a resource lifecycle error.
#[derive(Debug)]
pub struct ClientSession {
    id: Document,
    server_session: Mutex<Option<ServerSession>>,
    pool: Arc<ServerSessionPool>,
    causally_consistent: bool,
    cluster_time: Mutex<Option<ClusterTime>>,
    operation_time: Mutex<Option<Timestamp>>,
    closed: AtomicBool,
}

impl ClientSession {
    /// Starts a session backed by a server session from `pool`.
    pub fn new(pool: &Arc<ServerSessionPool>, causally_consistent: bool) -> Self {
        let server_session = pool.check_out();
        Self {
            id: server_session.id().clone(),
            server_session: Mutex::new(Some(server_session)),
            pool: pool.clone(),
            causally_consistent,
            cluster_time: Mutex::new(None),
            operation_time: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// The `lsid` document identifying this session.
    pub fn id(&self) -> &Document {
        &self.id
    }

    /// Whether reads through this session observe the session's own prior writes.
    pub fn is_causally_consistent(&self) -> bool {
        self.causally_consistent
    }

    /// The highest cluster time this session has seen.
    pub fn cluster_time(&self) -> Option<ClusterTime> {
        lock(&self.cluster_time).clone()
    }

    /// Advances the cluster time if `to` is greater than the current one.
    pub fn advance_cluster_time(&self, to: &ClusterTime) {
        let mut cluster_time = lock(&self.cluster_time);
        if cluster_time.as_ref().map(|current| current < to).unwrap_or(true) {
            *cluster_time = Some(to.clone());
        }
    }

    /// The operation time of the latest operation performed through this session.
    pub fn operation_time(&self) -> Option<Timestamp> {
        *lock(&self.operation_time)
    }

    /// Advances the operation time if `ts` is greater than the current one.
    pub fn advance_operation_time(&self, ts: Timestamp) {
        let mut operation_time = lock(&self.operation_time);
        if operation_time.map(|current| current < ts).unwrap_or(true) {
            *operation_time = Some(ts);
        }
    }

    /// Whether this session has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ends the session and returns its server session to the pool.
    pub fn close(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::lifecycle("session was already closed"));
        }

        if let Some(server_session) = lock(&self.server_session).take() {
            self.pool.check_in(server_session);
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The session state an operation runs under, consulted when stamping outgoing commands and
/// updated from their replies.
pub trait SessionContext: Send + Sync {
    /// Whether the operation runs under a session at all.
    fn has_session(&self) -> bool;

    /// Whether the session was created by, and is owned by, the binding the operation runs on.
    fn is_implicit_session(&self) -> bool;

    /// The `lsid` of the session, if there is one.
    fn session_id(&self) -> Option<Document>;

    /// Whether the session is causally consistent.
    fn is_causally_consistent(&self) -> bool;

    /// The session's operation time.
    fn operation_time(&self) -> Option<Timestamp>;

    /// Advances the session's operation time.
    fn advance_operation_time(&self, operation_time: Timestamp);

    /// The session's cluster time.
    fn cluster_time(&self) -> Option<ClusterTime>;

    /// Advances the session's cluster time.
    fn advance_cluster_time(&self, cluster_time: &ClusterTime);

    /// Fails if the session can no longer be used, e.g. because it was closed.
    fn ensure_usable(&self) -> Result<()> {
        Ok(())
    }
}

/// The context of an operation that runs without a session.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSessionContext;

impl SessionContext for NoSessionContext {
    fn has_session(&self) -> bool {
        false
    }

    fn is_implicit_session(&self) -> bool {
        false
    }

    fn session_id(&self) -> Option<Document> {
        None
    }

    fn is_causally_consistent(&self) -> bool {
        false
    }

    fn operation_time(&self) -> Option<Timestamp> {
        None
    }

    fn advance_operation_time(&self, _operation_time: Timestamp) {}

    fn cluster_time(&self) -> Option<ClusterTime> {
        None
    }

    fn advance_cluster_time(&self, _cluster_time: &ClusterTime) {}
}

/// The context of an operation running under a [`ClientSession`].
#[derive(Clone, Debug)]
pub struct ClientSessionContext {
    session: Arc<ClientSession>,
    is_implicit: bool,
}

impl ClientSessionContext {
    /// Creates a context for `session`. `is_implicit` records whether the session is owned by the
    /// driver rather than the caller.
    pub fn new(session: Arc<ClientSession>, is_implicit: bool) -> Self {
        Self {
            session,
            is_implicit,
        }
    }

    /// The session this context reports on.
    pub fn session(&self) -> &Arc<ClientSession> {
        &self.session
    }
}

impl SessionContext for ClientSessionContext {
    fn has_session(&self) -> bool {
        true
    }

    fn is_implicit_session(&self) -> bool {
        self.is_implicit
    }

    fn session_id(&self) -> Option<Document> {
        Some(self.session.id().clone())
    }

    fn is_causally_consistent(&self) -> bool {
        self.session.is_causally_consistent()
    }

    fn operation_time(&self) -> Option<Timestamp> {
        self.session.operation_time()
    }

    fn advance_operation_time(&self, operation_time: Timestamp) {
        self.session.advance_operation_time(operation_time)
    }

    fn cluster_time(&self) -> Option<ClusterTime> {
        self.session.cluster_time()
    }

    fn advance_cluster_time(&self, cluster_time: &ClusterTime) {
        self.session.advance_cluster_time(cluster_time)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.session.is_closed() {
            return Err(Error::lifecycle("attempted to use a closed session"));
        }
        Ok(())
    }
}
