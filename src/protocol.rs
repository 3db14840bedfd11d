//! Protocol executors: each runs exactly one logical operation as a wire exchange over a
//! [`Connection`].
//!
//! Every executor implements [`Protocol`], which provides the three ways of running it: awaiting
//! [`execute`](Protocol::execute), blocking on [`execute_sync`](Protocol::execute_sync), or
//! handing a callback to [`execute_with_callback`](Protocol::execute_with_callback). All three
//! drive the same exchange, so replies are classified and failures translated identically on
//! every path. When an executor is asked to [close the
//! connection](Protocol::close_connection), the connection is closed once the exchange ends
//! however it ends: with a result, with a server-reported failure, with a transport error, or by
//! the future being dropped.

mod command;
mod query;
mod write;

pub use self::{
    command::CommandProtocol,
    query::{GetMoreProtocol, KillCursorsProtocol, QueryOptions, QueryProtocol},
    write::{
        DeleteProtocol,
        DeleteRequest,
        InsertProtocol,
        InsertRequest,
        UpdateKind,
        UpdateProtocol,
        UpdateRequest,
    },
};
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;

use crate::{
    cmap::{
        conn::wire::{Reply, Response, ResponseFlags},
        Connection,
    },
    codec::Decoder,
    error::{Error, Result},
    options::{RequestContext, ServerAddress},
    runtime,
    BoxFuture,
};

/// The connection an executor runs over, and how it treats it.
#[derive(Clone, Debug)]
pub struct Endpoint {
    connection: Connection,
    close_connection: bool,
    context: RequestContext,
}

impl Endpoint {
    pub(crate) fn new(connection: Connection) -> Self {
        Self {
            connection,
            close_connection: false,
            context: RequestContext::default(),
        }
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    pub(crate) fn context(&self) -> &RequestContext {
        &self.context
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        self.connection.address()
    }
}

/// One logical operation, run as a single request/response cycle.
pub trait Protocol: Send + Sized {
    /// The result of a successful exchange.
    type Output: Send + 'static;

    #[doc(hidden)]
    fn endpoint(&self) -> &Endpoint;

    #[doc(hidden)]
    fn endpoint_mut(&mut self) -> &mut Endpoint;

    /// Builds the request, sends it and classifies the reply. Cleanup is the caller's business.
    #[doc(hidden)]
    fn exchange(&mut self) -> BoxFuture<'_, Result<Self::Output>>;

    /// The connection the operation runs over.
    fn connection(&self) -> &Connection {
        &self.endpoint().connection
    }

    /// Whether the connection is closed once the operation ends.
    fn closes_connection(&self) -> bool {
        self.endpoint().close_connection
    }

    /// Requests that the connection be closed once the operation ends, however it ends.
    fn close_connection(mut self, close_connection: bool) -> Self {
        self.endpoint_mut().close_connection = close_connection;
        self
    }

    /// Attaches correlation data that flows into the trace events of the exchange.
    fn request_context(mut self, context: RequestContext) -> Self {
        self.endpoint_mut().context = context;
        self
    }

    /// Runs the operation.
    fn execute(&mut self) -> BoxFuture<'_, Result<Self::Output>> {
        let guard = CloseGuard::new(self.endpoint());
        async move {
            let _guard = guard;
            self.exchange().await
        }
        .boxed()
    }

    /// Runs the operation, blocking the current thread until it completes.
    fn execute_sync(&mut self) -> Result<Self::Output> {
        runtime::block_on(self.execute())
    }

    /// Runs the operation in the background and hands its outcome to `callback`, which is
    /// invoked exactly once.
    fn execute_with_callback<F>(mut self, callback: F)
    where
        Self: 'static,
        F: FnOnce(Result<Self::Output>) + Send + 'static,
    {
        runtime::spawn(async move {
            let result = AssertUnwindSafe(self.execute())
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::internal("the operation panicked")));
            callback(result);
        });
    }
}

/// Closes the connection on drop when the executor asked for it.
struct CloseGuard {
    connection: Option<Connection>,
}

impl CloseGuard {
    fn new(endpoint: &Endpoint) -> Self {
        Self {
            connection: endpoint
                .close_connection
                .then(|| endpoint.connection.clone()),
        }
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}

/// Unwraps the OP_REPLY a legacy request must be answered with.
pub(crate) fn expect_reply(response: Option<Response>) -> Result<Reply> {
    match response {
        Some(Response::Reply(reply)) => Ok(reply),
        Some(Response::Message(_)) => Err(Error::invalid_response(
            "expected an OP_REPLY in response to a legacy request, got an OP_MSG",
        )),
        None => Err(Error::internal("a legacy query completed without a reply")),
    }
}

/// Classifies a legacy reply and decodes its documents.
///
/// The flags decide before the decoder gets a look: a reply flagged cursor-not-found fails with
/// the requested cursor id, and a reply flagged query-failure has its first document read as a
/// generic error document. Neither ever reaches `decoder`.
pub(crate) fn classify_reply<D: Decoder>(
    reply: &Reply,
    decoder: &D,
    cursor_id: i64,
    address: &ServerAddress,
) -> Result<Vec<D::Output>> {
    if reply.flags.contains(ResponseFlags::CURSOR_NOT_FOUND) {
        return Err(Error::cursor_not_found(cursor_id, address.clone()));
    }

    if reply.flags.contains(ResponseFlags::QUERY_FAILURE) {
        let document = reply
            .documents
            .first()
            .ok_or_else(|| Error::invalid_response("query failure reply without a document"))?
            .to_document()?;
        return Err(Error::query_failure(address, document));
    }

    reply
        .documents
        .iter()
        .map(|document| decoder.decode(document))
        .collect()
}
