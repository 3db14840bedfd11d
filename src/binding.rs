//! Bindings: what an operation executor receives to find the connections it runs on.
//!
//! A [`ReadWriteBinding`] yields [`ConnectionSource`]s for a read or a write intent, and carries
//! the session context every command sent through those sources is stamped with. Bindings and
//! sources are reference counted (see [`ReferenceCounted`]): every source holds a reference to
//! the binding it came from, so a binding's teardown runs only once the binding itself and every
//! source obtained from it have been released.

#[cfg(test)]
mod test;

use std::sync::Arc;

use derive_where::derive_where;
use futures_util::FutureExt;

use crate::{
    cmap::Connection,
    error::Result,
    options::ServerApi,
    ref_count::RefCount,
    sdam::{Cluster, Server, ServerDescription},
    selection_criteria::{ReadPreference, SelectionCriteria},
    session::{
        ClientSession,
        ClientSessionContext,
        NoSessionContext,
        ServerSessionPool,
        SessionContext,
    },
    trace::BINDING_TRACING_EVENT_TARGET,
    BoxFuture,
    ReferenceCounted,
};

/// A reference-counted handle yielding connections to one selected server.
pub trait ConnectionSource: ReferenceCounted {
    /// The description of the server the source resolved to.
    fn server_description(&self) -> ServerDescription;

    /// The session context of the binding the source was obtained from.
    fn session_context(&self) -> Arc<dyn SessionContext>;

    /// Checks out a connection to the server. The caller owns the connection's initial
    /// reference and must release it.
    fn connection(&self) -> BoxFuture<'_, Result<Connection>>;
}

/// Pairs read and write server selection with a session context.
pub trait ReadWriteBinding: ReferenceCounted {
    /// The read preference reads through this binding are routed with.
    fn read_preference(&self) -> ReadPreference;

    /// The session context of operations run through this binding.
    fn session_context(&self) -> Arc<dyn SessionContext>;

    /// The versioned API declared on commands run through this binding.
    fn server_api(&self) -> Option<ServerApi>;

    /// Returns a source for a server matching the binding's read preference. The caller owns the
    /// source's initial reference.
    fn read_connection_source(&self) -> BoxFuture<'_, Result<Arc<dyn ConnectionSource>>>;

    /// Returns a source for a server able to accept writes. The caller owns the source's
    /// initial reference.
    fn write_connection_source(&self) -> BoxFuture<'_, Result<Arc<dyn ConnectionSource>>>;
}

/// A binding that selects servers from a [`Cluster`], without a session.
#[derive(Clone, Debug)]
pub struct ClusterBinding {
    inner: Arc<ClusterBindingInner>,
}

#[derive_where(Debug)]
struct ClusterBindingInner {
    #[derive_where(skip)]
    cluster: Arc<dyn Cluster>,
    read_preference: ReadPreference,
    ref_count: RefCount,
}

impl ClusterBinding {
    /// Creates a binding routing reads according to `read_preference`. The caller owns the
    /// binding's initial reference.
    pub fn new(cluster: Arc<dyn Cluster>, read_preference: ReadPreference) -> Self {
        Self {
            inner: Arc::new(ClusterBindingInner {
                cluster,
                read_preference,
                ref_count: RefCount::new("binding"),
            }),
        }
    }

    /// Creates a binding routing reads to the primary.
    pub fn primary(cluster: Arc<dyn Cluster>) -> Self {
        Self::new(cluster, ReadPreference::Primary)
    }

    async fn connection_source(
        &self,
        criteria: SelectionCriteria,
    ) -> Result<Arc<dyn ConnectionSource>> {
        self.inner.ref_count.ensure_live()?;
        let server = self.inner.cluster.select_server(&criteria).await?;
        self.retain()?;
        Ok(Arc::new(ClusterConnectionSource {
            binding: self.clone(),
            server,
            ref_count: RefCount::new("connection source"),
        }))
    }
}

impl ReferenceCounted for ClusterBinding {
    fn count(&self) -> usize {
        self.inner.ref_count.get()
    }

    fn retain(&self) -> Result<()> {
        self.inner.ref_count.retain().map(|_| ())
    }

    fn release(&self) -> Result<()> {
        self.inner.ref_count.release().map(|_| ())
    }
}

impl ReadWriteBinding for ClusterBinding {
    fn read_preference(&self) -> ReadPreference {
        self.inner.read_preference.clone()
    }

    fn session_context(&self) -> Arc<dyn SessionContext> {
        Arc::new(NoSessionContext)
    }

    fn server_api(&self) -> Option<ServerApi> {
        self.inner.cluster.server_api()
    }

    fn read_connection_source(&self) -> BoxFuture<'_, Result<Arc<dyn ConnectionSource>>> {
        self.connection_source(self.inner.read_preference.clone().into())
            .boxed()
    }

    fn write_connection_source(&self) -> BoxFuture<'_, Result<Arc<dyn ConnectionSource>>> {
        self.connection_source(SelectionCriteria::for_writes())
            .boxed()
    }
}

/// A source of a [`ClusterBinding`]. Holds one reference to the binding until its own count
/// reaches zero.
#[derive_where(Debug)]
struct ClusterConnectionSource {
    binding: ClusterBinding,
    #[derive_where(skip)]
    server: Arc<dyn Server>,
    ref_count: RefCount,
}

impl ReferenceCounted for ClusterConnectionSource {
    fn count(&self) -> usize {
        self.ref_count.get()
    }

    fn retain(&self) -> Result<()> {
        self.ref_count.retain().map(|_| ())
    }

    fn release(&self) -> Result<()> {
        self.ref_count.release_then(|| self.binding.release())
    }
}

impl ConnectionSource for ClusterConnectionSource {
    fn server_description(&self) -> ServerDescription {
        self.server.description()
    }

    fn session_context(&self) -> Arc<dyn SessionContext> {
        self.binding.session_context()
    }

    fn connection(&self) -> BoxFuture<'_, Result<Connection>> {
        async move {
            self.ref_count.ensure_live()?;
            self.server.connection().await
        }
        .boxed()
    }
}

/// Decorates a binding with a client session.
///
/// Every source obtained through a `SessionBinding` reports the session's context, and holds a
/// reference to the `SessionBinding` until the source is released. When the binding owns its
/// session (an implicit session), the release that drops the last of those references closes
/// the session, exactly once, and then releases the one reference held on the wrapped binding.
/// A binding that does not own its session never closes it.
#[derive_where(Clone)]
#[derive(Debug)]
pub struct SessionBinding<B> {
    inner: Arc<SessionBindingInner<B>>,
}

#[derive(Debug)]
struct SessionBindingInner<B> {
    binding: B,
    session: Arc<ClientSession>,
    owns_session: bool,
    ref_count: RefCount,
}

impl<B: ReadWriteBinding + 'static> SessionBinding<B> {
    /// Wraps `binding` with `session`, taking over the caller's reference to `binding`. When
    /// `owns_session` is set, the session is closed once every reference derived from this
    /// binding has been released.
    pub fn new(binding: B, session: Arc<ClientSession>, owns_session: bool) -> Self {
        Self {
            inner: Arc::new(SessionBindingInner {
                binding,
                session,
                owns_session,
                ref_count: RefCount::new("session binding"),
            }),
        }
    }

    /// Wraps `binding` with a new implicit session from `pool`, owned by the returned binding.
    pub fn implicit(binding: B, pool: &Arc<ServerSessionPool>) -> Self {
        Self::new(binding, Arc::new(ClientSession::new(pool, false)), true)
    }

    /// Wraps `binding` with a session owned by the caller.
    pub fn explicit(binding: B, session: Arc<ClientSession>) -> Self {
        Self::new(binding, session, false)
    }

    /// The session attached to this binding.
    pub fn session(&self) -> &Arc<ClientSession> {
        &self.inner.session
    }

    /// Whether releasing this binding's last reference closes the session.
    pub fn owns_session(&self) -> bool {
        self.inner.owns_session
    }

    /// The binding this one decorates.
    pub fn inner(&self) -> &B {
        &self.inner.binding
    }

    async fn wrap(
        &self,
        source: impl std::future::Future<Output = Result<Arc<dyn ConnectionSource>>>,
    ) -> Result<Arc<dyn ConnectionSource>> {
        self.inner.ref_count.ensure_live()?;
        let source = source.await?;

        // Retained only once a source exists, so a dropped acquisition holds nothing.
        if let Err(error) = self.retain() {
            if let Err(release_error) = source.release() {
                tracing::warn!(
                    target: BINDING_TRACING_EVENT_TARGET,
                    failure = %release_error,
                    "Failed to release connection source of a released session binding",
                );
            }
            return Err(error);
        }

        Ok(Arc::new(SessionBindingSource {
            binding: self.clone(),
            source,
            ref_count: RefCount::new("connection source"),
        }))
    }

    fn teardown(&self) -> Result<()> {
        let close_result = if self.inner.owns_session {
            let result = self.inner.session.close();
            match result {
                Ok(()) => tracing::debug!(
                    target: BINDING_TRACING_EVENT_TARGET,
                    "Implicit session closed",
                ),
                Err(ref error) => tracing::warn!(
                    target: BINDING_TRACING_EVENT_TARGET,
                    failure = %error,
                    "Failed to close implicit session",
                ),
            }
            result
        } else {
            Ok(())
        };

        let release_result = self.inner.binding.release();
        close_result.and(release_result)
    }
}

impl<B: ReadWriteBinding + 'static> ReferenceCounted for SessionBinding<B> {
    fn count(&self) -> usize {
        self.inner.ref_count.get()
    }

    fn retain(&self) -> Result<()> {
        self.inner.ref_count.retain().map(|_| ())
    }

    fn release(&self) -> Result<()> {
        self.inner.ref_count.release_then(|| self.teardown())
    }
}

impl<B: ReadWriteBinding + 'static> ReadWriteBinding for SessionBinding<B> {
    fn read_preference(&self) -> ReadPreference {
        self.inner.binding.read_preference()
    }

    fn session_context(&self) -> Arc<dyn SessionContext> {
        Arc::new(ClientSessionContext::new(
            self.inner.session.clone(),
            self.inner.owns_session,
        ))
    }

    fn server_api(&self) -> Option<ServerApi> {
        self.inner.binding.server_api()
    }

    fn read_connection_source(&self) -> BoxFuture<'_, Result<Arc<dyn ConnectionSource>>> {
        self.wrap(self.inner.binding.read_connection_source()).boxed()
    }

    fn write_connection_source(&self) -> BoxFuture<'_, Result<Arc<dyn ConnectionSource>>> {
        self.wrap(self.inner.binding.write_connection_source()).boxed()
    }
}

/// Wraps a source of the decorated binding, reporting the session's context.
#[derive_where(Debug; B)]
struct SessionBindingSource<B> {
    binding: SessionBinding<B>,
    #[derive_where(skip)]
    source: Arc<dyn ConnectionSource>,
    ref_count: RefCount,
}

impl<B: ReadWriteBinding + 'static> ReferenceCounted for SessionBindingSource<B> {
    fn count(&self) -> usize {
        self.ref_count.get()
    }

    fn retain(&self) -> Result<()> {
        self.ref_count.retain().map(|_| ())
    }

    fn release(&self) -> Result<()> {
        self.ref_count.release_then(|| {
            let source_result = self.source.release();
            let binding_result = self.binding.release();
            source_result.and(binding_result)
        })
    }
}

impl<B: ReadWriteBinding + 'static> ConnectionSource for SessionBindingSource<B> {
    fn server_description(&self) -> ServerDescription {
        self.source.server_description()
    }

    fn session_context(&self) -> Arc<dyn SessionContext> {
        self.binding.session_context()
    }

    fn connection(&self) -> BoxFuture<'_, Result<Connection>> {
        async move {
            self.ref_count.ensure_live()?;
            self.binding.session_context().ensure_usable()?;
            self.source.connection().await
        }
        .boxed()
    }
}
