mod command;
pub(crate) mod wire;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use derive_where::derive_where;
use tokio::{
    io::{AsyncRead, AsyncWrite, BufStream},
    sync::Mutex,
};
use typed_builder::TypedBuilder;

pub(crate) use self::command::{Command, CommandResponse};
pub use self::command::{PayloadKind, SplittablePayload};
use self::wire::{Request, Response};
use crate::{
    bson::Document,
    codec::Decoder,
    error::{Error, Result},
    options::{RequestContext, ServerAddress, ServerApi},
    protocol::{
        CommandProtocol,
        DeleteProtocol,
        DeleteRequest,
        GetMoreProtocol,
        InsertProtocol,
        InsertRequest,
        KillCursorsProtocol,
        Protocol,
        QueryOptions,
        QueryProtocol,
        UpdateProtocol,
        UpdateRequest,
    },
    ref_count::RefCount,
    results::{QueryResult, WriteConcernResult},
    sdam::ServerType,
    selection_criteria::ReadPreference,
    session::SessionContext,
    trace::{COMMAND_TRACING_EVENT_TARGET, CONNECTION_TRACING_EVENT_TARGET},
    validation::FieldNameValidator,
    Namespace,
    ReferenceCounted,
};

/// The default maximum size of a BSON document the server accepts.
pub const DEFAULT_MAX_DOCUMENT_SIZE: i32 = 16 * 1024 * 1024;

/// The default maximum size of a wire protocol message.
pub const DEFAULT_MAX_MESSAGE_SIZE: i32 = 48_000_000;

/// The default maximum number of writes in one write command.
pub const DEFAULT_MAX_WRITE_BATCH_SIZE: usize = 100_000;

/// The newest wire version this crate speaks.
pub const LATEST_WIRE_VERSION: i32 = 21;

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

/// A byte stream a [`Connection`] can speak the wire protocol over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Identifies a connection: the server it is connected to and a driver-assigned number that is
/// unique within the process.
#[derive(Clone, Debug, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{local_value}@{address}")]
pub struct ConnectionId {
    address: ServerAddress,
    local_value: u32,
}

impl ConnectionId {
    /// The address of the server the connection is connected to.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The driver-assigned number of the connection.
    pub fn local_value(&self) -> u32 {
        self.local_value
    }
}

/// What a connection is dedicated to, if anything. Pinning is metadata consulted by whoever
/// pools connections; it does not restrict what the connection can be used for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, derive_more::Display)]
#[repr(u8)]
pub enum PinningMode {
    /// Not pinned.
    #[default]
    None = 0,

    /// Pinned to a cursor, whose getMores must reach the same server.
    Cursor = 1,

    /// Pinned to a transaction.
    Transaction = 2,
}

impl PinningMode {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Cursor,
            2 => Self::Transaction,
            _ => Self::None,
        }
    }
}

/// Information about the server on the other end of a connection, negotiated when the
/// connection was established and fixed for its lifetime.
#[derive(Clone, Debug, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ConnectionDescription {
    /// The address of the server.
    #[builder(!default)]
    pub address: ServerAddress,

    /// The type of the server when the connection was established.
    pub server_type: ServerType,

    /// The maximum wire version that the server understands.
    #[builder(default = LATEST_WIRE_VERSION)]
    pub max_wire_version: i32,

    /// The maximum size of a BSON document the server accepts.
    #[builder(default = DEFAULT_MAX_DOCUMENT_SIZE)]
    pub max_document_size: i32,

    /// The maximum permitted size of a wire protocol message.
    #[builder(default = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: i32,

    /// The maximum number of inserts, updates, or deletes that can be included in a write batch.
    #[builder(default = DEFAULT_MAX_WRITE_BATCH_SIZE)]
    pub max_write_batch_size: usize,

    /// How long sessions started on this server stay alive without executing an operation.
    #[builder(setter(strip_option))]
    pub logical_session_timeout: Option<Duration>,
}

impl ConnectionDescription {
    /// Whether writes go through the `insert`/`update`/`delete` commands.
    pub(crate) fn supports_write_commands(&self) -> bool {
        self.max_wire_version >= 2
    }

    /// Whether queries go through the `find`/`getMore`/`killCursors` commands.
    pub(crate) fn supports_find_command(&self) -> bool {
        self.max_wire_version >= 4
    }

    /// Whether commands are framed as OP_MSG.
    pub(crate) fn supports_op_msg(&self) -> bool {
        self.max_wire_version >= 6
    }

    pub(crate) fn max_document_size_bytes(&self) -> usize {
        usize::try_from(self.max_document_size).unwrap_or(0)
    }

    pub(crate) fn max_message_size_bytes(&self) -> usize {
        usize::try_from(self.max_message_size).unwrap_or(0)
    }
}

/// A wire protocol channel to a single server.
///
/// `Connection` is a cheap handle; clones share one underlying channel. Its lifetime is governed
/// by the explicit reference count of [`ReferenceCounted`]: the creator holds the first
/// reference, and the release that brings the count to zero closes the channel. Cloning a handle
/// does not retain the connection; use [`retained`](Connection::retained) for that.
#[derive(Clone, Debug)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

#[derive_where(Debug)]
struct ConnectionInner {
    id: ConnectionId,
    description: ConnectionDescription,
    #[derive_where(skip)]
    stream: Mutex<Option<BufStream<Box<dyn AsyncStream>>>>,
    closed: AtomicBool,
    pinning_mode: AtomicU8,
    ref_count: RefCount,
}

impl Connection {
    /// Wraps an established stream to the server described by `description`. The caller owns
    /// the connection's single initial reference.
    pub fn new(stream: impl AsyncStream, description: ConnectionDescription) -> Self {
        let id = ConnectionId {
            address: description.address.clone(),
            local_value: NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst),
        };
        let stream: Box<dyn AsyncStream> = Box::new(stream);
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                id,
                description,
                stream: Mutex::new(Some(BufStream::new(stream))),
                closed: AtomicBool::new(false),
                pinning_mode: AtomicU8::new(PinningMode::None as u8),
                ref_count: RefCount::new("connection"),
            }),
        };
        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            serverHost = connection.address().host(),
            serverPort = connection.address().port(),
            driverConnectionId = connection.inner.id.local_value,
            maxWireVersion = connection.inner.description.max_wire_version,
            "Connection created",
        );
        connection
    }

    /// The connection's identity.
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// The address of the server this connection is connected to.
    pub fn address(&self) -> &ServerAddress {
        &self.inner.description.address
    }

    /// The description negotiated when the connection was established.
    pub fn description(&self) -> &ConnectionDescription {
        &self.inner.description
    }

    /// Records what the connection is dedicated to. Marking it again with the same mode is a
    /// no-op, and the reference count is never touched.
    pub fn mark_as_pinned(&self, mode: PinningMode) {
        let previous = self.inner.pinning_mode.swap(mode as u8, Ordering::SeqCst);
        if previous != mode as u8 {
            tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                serverHost = self.address().host(),
                serverPort = self.address().port(),
                driverConnectionId = self.inner.id.local_value,
                pinningMode = %mode,
                "Connection pinned",
            );
        }
    }

    /// What the connection is currently pinned to.
    pub fn pinning_mode(&self) -> PinningMode {
        PinningMode::from_u8(self.inner.pinning_mode.load(Ordering::SeqCst))
    }

    /// Whether the connection has been closed, either explicitly, by releasing its last
    /// reference, or because an exchange over it failed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Closes the underlying channel. Every later exchange fails with
    /// [`ErrorKind::ConnectionClosed`](crate::error::ErrorKind::ConnectionClosed). Closing does
    /// not affect the reference count, and closing twice is a no-op.
    pub fn close(&self) {
        self.close_with_reason("closed by the driver");
    }

    fn close_with_reason(&self, reason: &str) {
        if !self.mark_closed(reason) {
            return;
        }
        // An exchange in flight holds the lock and drops the stream itself once it sees the flag.
        if let Ok(mut stream) = self.inner.stream.try_lock() {
            stream.take();
        }
    }

    /// Flags the connection as closed. Returns whether this call was the one that closed it.
    fn mark_closed(&self, reason: &str) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            serverHost = self.address().host(),
            serverPort = self.address().port(),
            driverConnectionId = self.inner.id.local_value,
            reason,
            "Connection closed",
        );
        true
    }

    /// Retains the connection and returns a handle owning the new reference.
    pub fn retained(&self) -> Result<Connection> {
        self.retain()?;
        Ok(self.clone())
    }

    fn ensure_open(&self) -> Result<()> {
        self.inner.ref_count.ensure_live()?;
        if self.is_closed() {
            return Err(Error::connection_closed(format!(
                "connection {} is closed",
                self.inner.id
            )));
        }
        Ok(())
    }

    /// Sends `request` and, if the request expects one, waits for the server's response.
    ///
    /// Any failure after the first byte is written leaves the channel in an unknown state, so the
    /// connection is closed before the error is returned.
    pub(crate) async fn send_message(
        &self,
        request: Request,
        context: &RequestContext,
    ) -> Result<Option<Response>> {
        self.ensure_open()?;

        let request_id = wire::next_request_id();
        let bytes = request.encode(request_id)?;
        if bytes.len() > self.inner.description.max_message_size_bytes() {
            return Err(Error::invalid_argument(format!(
                "message of {} bytes exceeds the maximum message size of {} bytes",
                bytes.len(),
                self.inner.description.max_message_size
            )));
        }

        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            requestId = request_id,
            opName = request.op_name(),
            serverHost = self.address().host(),
            serverPort = self.address().port(),
            driverConnectionId = self.inner.id.local_value,
            operationId = context.operation_id,
            operationName = context.operation_name.as_deref(),
            "Sending message",
        );

        let mut stream = self.inner.stream.lock().await;
        let Some(channel) = stream.as_mut() else {
            return Err(Error::connection_closed(format!(
                "connection {} is closed",
                self.inner.id
            )));
        };

        let mut cancel_guard = CloseOnDrop {
            connection: self,
            armed: true,
        };
        let result = exchange(
            channel,
            &bytes,
            request_id,
            request.expects_response(),
            self.inner.description.max_message_size,
        )
        .await;
        cancel_guard.armed = false;

        match result {
            Ok(response) => {
                if self.is_closed() {
                    stream.take();
                }
                tracing::debug!(
                    target: COMMAND_TRACING_EVENT_TARGET,
                    requestId = request_id,
                    opName = request.op_name(),
                    driverConnectionId = self.inner.id.local_value,
                    responseReceived = response.is_some(),
                    "Message exchange succeeded",
                );
                Ok(response)
            }
            Err(error) => {
                self.mark_closed("the exchange failed");
                stream.take();
                tracing::debug!(
                    target: COMMAND_TRACING_EVENT_TARGET,
                    requestId = request_id,
                    opName = request.op_name(),
                    driverConnectionId = self.inner.id.local_value,
                    failure = %error,
                    "Message exchange failed",
                );
                Err(error)
            }
        }
    }

    /// Inserts one document.
    pub async fn insert(
        &self,
        namespace: &Namespace,
        ordered: bool,
        request: InsertRequest,
        context: &RequestContext,
    ) -> Result<WriteConcernResult> {
        InsertProtocol::new(self.clone(), namespace.clone(), ordered, request)
            .request_context(context.clone())
            .execute()
            .await
    }

    /// Applies one update.
    pub async fn update(
        &self,
        namespace: &Namespace,
        ordered: bool,
        request: UpdateRequest,
        context: &RequestContext,
    ) -> Result<WriteConcernResult> {
        UpdateProtocol::new(self.clone(), namespace.clone(), ordered, request)
            .request_context(context.clone())
            .execute()
            .await
    }

    /// Applies one delete.
    pub async fn delete(
        &self,
        namespace: &Namespace,
        ordered: bool,
        request: DeleteRequest,
        context: &RequestContext,
    ) -> Result<WriteConcernResult> {
        DeleteProtocol::new(self.clone(), namespace.clone(), ordered, request)
            .request_context(context.clone())
            .execute()
            .await
    }

    /// Runs `command` against `database` and decodes the reply with `decoder`.
    ///
    /// Field names are checked with `validator` before anything is sent; `read_preference` is
    /// `None` for writes.
    #[allow(clippy::too_many_arguments)]
    pub async fn command<D: Decoder>(
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
        crate::validation::validate_document(&command, validator)?;
        let mut protocol = CommandProtocol::new(self.clone(), database, command, decoder)
            .read_preference(read_preference)
            .session_context(session_context)
            .server_api(server_api)
            .request_context(context.clone());
        protocol.execute().await?.ok_or_else(|| {
            Error::internal("an acknowledged command completed without a reply")
        })
    }

    /// Runs `command` with as much of `payload` as fits in one message, advancing the payload
    /// past the documents that were sent.
    ///
    /// Returns `None` when `response_expected` is `false`: the message is sent with the
    /// `moreToCome` flag and the server does not reply.
    #[allow(clippy::too_many_arguments)]
    pub async fn command_with_payload<D: Decoder>(
        &self,
        database: &str,
        command: Document,
        validator: &dyn FieldNameValidator,
        read_preference: Option<ReadPreference>,
        decoder: D,
        session_context: Arc<dyn SessionContext>,
        server_api: Option<ServerApi>,
        response_expected: bool,
        payload: &mut SplittablePayload,
        context: &RequestContext,
    ) -> Result<Option<D::Output>> {
        crate::validation::validate_document(&command, validator)?;
        let owned = std::mem::replace(payload, SplittablePayload::placeholder(payload.kind()));
        let mut protocol = CommandProtocol::new(self.clone(), database, command, decoder)
            .read_preference(read_preference)
            .session_context(session_context)
            .server_api(server_api)
            .response_expected(response_expected)
            .payload(owned)
            .request_context(context.clone());
        let result = protocol.execute().await;
        if let Some(advanced) = protocol.take_payload() {
            *payload = advanced;
        }
        result
    }

    /// Runs a query, through a legacy OP_QUERY or a `find` command depending on the server.
    pub async fn query<D: Decoder>(
        &self,
        namespace: &Namespace,
        filter: Document,
        options: QueryOptions,
        decoder: D,
        context: &RequestContext,
    ) -> Result<QueryResult<D::Output>> {
        QueryProtocol::new(self.clone(), namespace.clone(), filter, options, decoder)
            .request_context(context.clone())
            .execute()
            .await
    }

    /// Fetches the next batch of the cursor `cursor_id`.
    pub async fn get_more<D: Decoder>(
        &self,
        namespace: &Namespace,
        cursor_id: i64,
        number_to_return: i32,
        decoder: D,
        context: &RequestContext,
    ) -> Result<QueryResult<D::Output>> {
        GetMoreProtocol::new(
            self.clone(),
            namespace.clone(),
            cursor_id,
            number_to_return,
            decoder,
        )
        .request_context(context.clone())
        .execute()
        .await
    }

    /// Kills the given cursors. Best-effort: the server's verdict is not reported.
    pub async fn kill_cursors(
        &self,
        namespace: &Namespace,
        cursor_ids: Vec<i64>,
        context: &RequestContext,
    ) -> Result<()> {
        KillCursorsProtocol::new(self.clone(), namespace.clone(), cursor_ids)
            .request_context(context.clone())
            .execute()
            .await
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection {}", self.inner.id)
    }
}

impl ReferenceCounted for Connection {
    fn count(&self) -> usize {
        self.inner.ref_count.get()
    }

    fn retain(&self) -> Result<()> {
        self.inner.ref_count.retain().map(|_| ())
    }

    fn release(&self) -> Result<()> {
        self.inner.ref_count.release_then(|| {
            self.close_with_reason("the last reference was released");
            Ok(())
        })
    }
}

/// Closes the connection if the exchange it guards never completes, e.g. because the future
/// driving it was dropped half-way through a write.
struct CloseOnDrop<'a> {
    connection: &'a Connection,
    armed: bool,
}

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.connection.mark_closed("the exchange was cancelled");
        }
    }
}

async fn exchange(
    channel: &mut BufStream<Box<dyn AsyncStream>>,
    bytes: &[u8],
    request_id: i32,
    expects_response: bool,
    max_message_size: i32,
) -> Result<Option<Response>> {
    wire::write_framed(channel, bytes).await?;
    if !expects_response {
        return Ok(None);
    }

    let (response_to, response) = Response::read_from(channel, max_message_size).await?;
    if response_to != request_id {
        return Err(Error::invalid_response(format!(
            "expected a response to request {} but got a response to request {}",
            request_id, response_to
        )));
    }
    Ok(Some(response))
}
