//! Operations that run against a [`ReadWriteBinding`] rather than a fixed connection.
//!
//! An operation acquires a connection source for its intent, checks a connection out of it, runs
//! its protocol exchange and releases the connection and then the source, on every exit path.

#[cfg(test)]
mod test;

use std::{future::Future, sync::Arc};

use futures_util::FutureExt;

use crate::{
    binding::{ConnectionSource, ReadWriteBinding},
    bson::{doc, Document},
    cmap::Connection,
    codec::{Decoder, DocumentDecoder},
    concern::WriteConcern,
    error::{Error, Result},
    options::RequestContext,
    protocol::{DeleteProtocol, DeleteRequest, Protocol},
    trace::BINDING_TRACING_EVENT_TARGET,
    validation::NoOpFieldNameValidator,
    BoxFuture,
    Namespace,
    ReferenceCounted,
};

/// A logical operation executed through a binding.
pub trait Operation: Send {
    /// The output type of this operation.
    type O: Send + 'static;

    /// The name of the operation, reported in trace events.
    const NAME: &'static str;

    /// Runs the operation against `binding`.
    fn execute<'a>(self, binding: &'a dyn ReadWriteBinding) -> BoxFuture<'a, Result<Self::O>>
    where
        Self: 'a;
}

/// Runs `operation` over a connection from the binding's read connection source.
///
/// The connection and the source are released once `operation` completes, whether it succeeds or
/// fails; an error from `operation` takes precedence over a release failure.
pub async fn with_read_connection<T, F, Fut>(
    binding: &dyn ReadWriteBinding,
    operation: F,
) -> Result<T>
where
    F: FnOnce(Arc<dyn ConnectionSource>, Connection) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let source = binding.read_connection_source().await?;
    with_connection(source, operation).await
}

/// Runs `operation` over a connection from the binding's write connection source. Releases
/// happen exactly as in [`with_read_connection`].
pub async fn with_write_connection<T, F, Fut>(
    binding: &dyn ReadWriteBinding,
    operation: F,
) -> Result<T>
where
    F: FnOnce(Arc<dyn ConnectionSource>, Connection) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let source = binding.write_connection_source().await?;
    with_connection(source, operation).await
}

async fn with_connection<T, F, Fut>(source: Arc<dyn ConnectionSource>, operation: F) -> Result<T>
where
    F: FnOnce(Arc<dyn ConnectionSource>, Connection) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut lease = Lease {
        source: Some(source.clone()),
        connection: None,
    };
    let connection = source.connection().await?;
    lease.connection = Some(connection.clone());

    let result = operation(source, connection).await;
    let released = lease.finish();
    match result {
        Ok(output) => released.map(|()| output),
        Err(error) => Err(error),
    }
}

/// The references an operation holds. Dropping an unfinished lease, e.g. because the future
/// running the operation was cancelled, still releases them.
struct Lease {
    source: Option<Arc<dyn ConnectionSource>>,
    connection: Option<Connection>,
}

impl Lease {
    /// Releases the connection and then the source, reporting the first failure after attempting
    /// both.
    fn finish(&mut self) -> Result<()> {
        let connection_released = self
            .connection
            .take()
            .map_or(Ok(()), |connection| connection.release());
        let source_released = self
            .source
            .take()
            .map_or(Ok(()), |source| source.release());
        for error in [&connection_released, &source_released]
            .into_iter()
            .filter_map(|result| result.as_ref().err())
        {
            tracing::warn!(
                target: BINDING_TRACING_EVENT_TARGET,
                failure = %error,
                "Failed to release operation resources",
            );
        }
        connection_released.and(source_released)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

fn request_context(name: &str) -> RequestContext {
    RequestContext::builder().operation_name(name).build()
}

/// Runs an arbitrary read command with the binding's read preference, session and declared
/// API version.
#[derive(Debug, Clone)]
pub struct RunCommand<D = DocumentDecoder> {
    database: String,
    command: Document,
    decoder: D,
}

impl RunCommand {
    /// Creates an operation running `command` against `database`, returning the reply document.
    pub fn new(database: impl Into<String>, command: Document) -> Self {
        Self::with_decoder(database, command, DocumentDecoder)
    }
}

impl<D: Decoder> RunCommand<D> {
    /// Creates an operation running `command` against `database`, decoding the reply with
    /// `decoder`.
    pub fn with_decoder(database: impl Into<String>, command: Document, decoder: D) -> Self {
        Self {
            database: database.into(),
            command,
            decoder,
        }
    }
}

impl<D: Decoder> Operation for RunCommand<D> {
    type O = D::Output;

    const NAME: &'static str = "runCommand";

    fn execute<'a>(self, binding: &'a dyn ReadWriteBinding) -> BoxFuture<'a, Result<Self::O>>
    where
        Self: 'a,
    {
        async move {
            if self.command.is_empty() {
                return Err(Error::invalid_argument(
                    "an empty document cannot be run as a command",
                ));
            }

            let read_preference = binding.read_preference();
            let server_api = binding.server_api();
            with_read_connection(binding, |source, connection| async move {
                connection
                    .command(
                        &self.database,
                        self.command,
                        &NoOpFieldNameValidator,
                        Some(read_preference),
                        self.decoder,
                        source.session_context(),
                        server_api,
                        &request_context(Self::NAME),
                    )
                    .await
            })
            .await
        }
        .boxed()
    }
}

/// Removes a user from a database.
///
/// Servers that accept write commands get a `dropUser` command; older servers store users as
/// plain documents, so the user's document is deleted from `system.users` instead.
#[derive(Debug, Clone)]
pub struct DropUser {
    database: String,
    user_name: String,
    write_concern: Option<WriteConcern>,
}

impl DropUser {
    /// Creates an operation dropping `user_name` from `database`.
    pub fn new(database: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            user_name: user_name.into(),
            write_concern: None,
        }
    }

    /// The write concern the removal is acknowledged with.
    pub fn write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = Some(write_concern);
        self
    }

    fn command(&self) -> Result<Document> {
        let mut command = doc! { Self::NAME: self.user_name.as_str() };
        if let Some(write_concern) = self.write_concern.as_ref().filter(|wc| !wc.is_empty()) {
            command.insert("writeConcern", crate::bson::to_bson(write_concern)?);
        }
        Ok(command)
    }
}

impl Operation for DropUser {
    type O = ();

    const NAME: &'static str = "dropUser";

    fn execute<'a>(self, binding: &'a dyn ReadWriteBinding) -> BoxFuture<'a, Result<Self::O>>
    where
        Self: 'a,
    {
        async move {
            let server_api = binding.server_api();
            with_write_connection(binding, |source, connection| async move {
                let context = request_context(Self::NAME);
                if connection.description().supports_write_commands() {
                    connection
                        .command(
                            &self.database,
                            self.command()?,
                            &NoOpFieldNameValidator,
                            None,
                            DocumentDecoder,
                            source.session_context(),
                            server_api,
                            &context,
                        )
                        .await?;
                    return Ok(());
                }

                let mut delete = DeleteProtocol::new(
                    connection,
                    Namespace::new(self.database.as_str(), "system.users"),
                    true,
                    DeleteRequest::builder()
                        .filter(doc! { "user": self.user_name.as_str() })
                        .build(),
                )
                .request_context(context);
                if let Some(write_concern) = self.write_concern {
                    delete = delete.write_concern(write_concern);
                }
                delete.execute().await.map(|_| ())
            })
            .await
        }
        .boxed()
    }
}
