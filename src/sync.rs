//! Blocking facades over the async API. This is only available when the `sync` feature is
//! enabled.
//!
//! Every call drives the same async code path to completion on the crate's runtime, so replies
//! are classified, failures translated and references released exactly as they are for async
//! callers.

#[cfg(test)]
mod test;

use std::sync::Arc;

use crate::{
    binding::{ConnectionSource as AsyncConnectionSource, ReadWriteBinding},
    bson::Document,
    cmap::{ConnectionDescription, PinningMode},
    codec::Decoder,
    error::Result,
    operation::Operation,
    options::{RequestContext, ServerAddress, ServerApi},
    protocol::{DeleteRequest, InsertRequest, QueryOptions, UpdateRequest},
    results::{QueryResult, WriteConcernResult},
    runtime,
    sdam::ServerDescription,
    selection_criteria::ReadPreference,
    session::SessionContext,
    validation::FieldNameValidator,
    Connection as AsyncConnection,
    Namespace,
    ReferenceCounted,
};

/// A blocking handle to a wire protocol channel. See
/// [`crate::Connection`] for the reference counting rules, which are shared with the async
/// handle it wraps.
#[derive(Clone, Debug)]
pub struct Connection {
    async_connection: AsyncConnection,
}

impl Connection {
    /// Wraps an async connection handle. No reference is taken.
    pub fn new(async_connection: AsyncConnection) -> Self {
        Self { async_connection }
    }

    /// The async handle this facade drives.
    pub fn as_async(&self) -> &AsyncConnection {
        &self.async_connection
    }

    /// The address of the server this connection is connected to.
    pub fn address(&self) -> &ServerAddress {
        self.async_connection.address()
    }

    /// The description negotiated when the connection was established.
    pub fn description(&self) -> &ConnectionDescription {
        self.async_connection.description()
    }

    /// Records what the connection is dedicated to.
    pub fn mark_as_pinned(&self, mode: PinningMode) {
        self.async_connection.mark_as_pinned(mode)
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.async_connection.is_closed()
    }

    /// Closes the underlying channel.
    pub fn close(&self) {
        self.async_connection.close()
    }

    /// Inserts one document.
    pub fn insert(
        &self,
        namespace: &Namespace,
        ordered: bool,
        request: InsertRequest,
        context: &RequestContext,
    ) -> Result<WriteConcernResult> {
        runtime::block_on(
            self.async_connection
                .insert(namespace, ordered, request, context),
        )
    }

    /// Applies one update.
    pub fn update(
        &self,
        namespace: &Namespace,
        ordered: bool,
        request: UpdateRequest,
        context: &RequestContext,
    ) -> Result<WriteConcernResult> {
        runtime::block_on(
            self.async_connection
                .update(namespace, ordered, request, context),
        )
    }

    /// Applies one delete.
    pub fn delete(
        &self,
        namespace: &Namespace,
        ordered: bool,
        request: DeleteRequest,
        context: &RequestContext,
    ) -> Result<WriteConcernResult> {
        runtime::block_on(
            self.async_connection
                .delete(namespace, ordered, request, context),
        )
    }

    /// Runs `command` against `database` and decodes the reply with `decoder`.
    #[allow(clippy::too_many_arguments)]
    pub fn command<D: Decoder>(
        &self,
        database: &str,
        command: Document,
        validator: &dyn FieldNameValidator,
        read_preference: Option<ReadPreference>,
        decoder: D,
        session_context: Arc<dyn SessionContext>,
        server_api: Option<ServerApi>,
        context: &RequestContext,
    ) -> Result<D::Output> {
        runtime::block_on(self.async_connection.command(
            database,
            command,
            validator,
            read_preference,
            decoder,
            session_context,
            server_api,
            context,
        ))
    }

    /// Runs a query and returns its first batch.
    pub fn query<D: Decoder>(
        &self,
        namespace: &Namespace,
        filter: Document,
        options: QueryOptions,
        decoder: D,
        context: &RequestContext,
    ) -> Result<QueryResult<D::Output>> {
        runtime::block_on(
            self.async_connection
                .query(namespace, filter, options, decoder, context),
        )
    }

    /// Fetches the next batch of the cursor `cursor_id`.
    pub fn get_more<D: Decoder>(
        &self,
        namespace: &Namespace,
        cursor_id: i64,
        number_to_return: i32,
        decoder: D,
        context: &RequestContext,
    ) -> Result<QueryResult<D::Output>> {
        runtime::block_on(self.async_connection.get_more(
            namespace,
            cursor_id,
            number_to_return,
            decoder,
            context,
        ))
    }

    /// Kills the given cursors.
    pub fn kill_cursors(
        &self,
        namespace: &Namespace,
        cursor_ids: Vec<i64>,
        context: &RequestContext,
    ) -> Result<()> {
        runtime::block_on(
            self.async_connection
                .kill_cursors(namespace, cursor_ids, context),
        )
    }
}

impl ReferenceCounted for Connection {
    fn count(&self) -> usize {
        self.async_connection.count()
    }

    fn retain(&self) -> Result<()> {
        self.async_connection.retain()
    }

    fn release(&self) -> Result<()> {
        self.async_connection.release()
    }
}

/// A blocking handle to a connection source.
#[derive(Clone)]
pub struct ConnectionSource {
    async_source: Arc<dyn AsyncConnectionSource>,
}

impl std::fmt::Debug for ConnectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSource")
            .field("server", &self.async_source.server_description().address)
            .field("count", &self.async_source.count())
            .finish()
    }
}

impl ConnectionSource {
    /// Wraps an async connection source. No reference is taken.
    pub fn new(async_source: Arc<dyn AsyncConnectionSource>) -> Self {
        Self { async_source }
    }

    /// The description of the server the source was selected for.
    pub fn server_description(&self) -> ServerDescription {
        self.async_source.server_description()
    }

    /// The session context operations through this source run under.
    pub fn session_context(&self) -> Arc<dyn SessionContext> {
        self.async_source.session_context()
    }

    /// Checks out a connection. The caller owns its single reference.
    pub fn connection(&self) -> Result<Connection> {
        runtime::block_on(self.async_source.connection()).map(Connection::new)
    }
}

impl ReferenceCounted for ConnectionSource {
    fn count(&self) -> usize {
        self.async_source.count()
    }

    fn retain(&self) -> Result<()> {
        self.async_source.retain()
    }

    fn release(&self) -> Result<()> {
        self.async_source.release()
    }
}

/// A blocking facade over a [`ReadWriteBinding`].
#[derive(Clone, Debug)]
pub struct Binding<B> {
    async_binding: B,
}

impl<B: ReadWriteBinding> Binding<B> {
    /// Wraps an async binding. No reference is taken.
    pub fn new(async_binding: B) -> Self {
        Self { async_binding }
    }

    /// The async binding this facade drives.
    pub fn as_async(&self) -> &B {
        &self.async_binding
    }

    /// The read preference reads through this binding use.
    pub fn read_preference(&self) -> ReadPreference {
        self.async_binding.read_preference()
    }

    /// The session context of the binding.
    pub fn session_context(&self) -> Arc<dyn SessionContext> {
        self.async_binding.session_context()
    }

    /// Selects a server for reading and returns a source for it.
    pub fn read_connection_source(&self) -> Result<ConnectionSource> {
        runtime::block_on(self.async_binding.read_connection_source()).map(ConnectionSource::new)
    }

    /// Selects a server for writing and returns a source for it.
    pub fn write_connection_source(&self) -> Result<ConnectionSource> {
        runtime::block_on(self.async_binding.write_connection_source()).map(ConnectionSource::new)
    }

    /// Runs `operation` against the binding.
    pub fn execute<O: Operation>(&self, operation: O) -> Result<O::O> {
        runtime::block_on(operation.execute(&self.async_binding))
    }
}

impl<B: ReadWriteBinding> ReferenceCounted for Binding<B> {
    fn count(&self) -> usize {
        self.async_binding.count()
    }

    fn retain(&self) -> Result<()> {
        self.async_binding.retain()
    }

    fn release(&self) -> Result<()> {
        self.async_binding.release()
    }
}
