use futures_util::FutureExt;
use typed_builder::TypedBuilder;

use super::{classify_reply, expect_reply, Endpoint, Protocol};
use crate::{
    bson::{doc, Document, RawDocument},
    bson_util,
    cmap::{
        conn::wire::{GetMore, KillCursors, Query, QueryFlags, Request},
        Command,
        CommandResponse,
        Connection,
    },
    codec::Decoder,
    error::{Error, Result, CURSOR_NOT_FOUND_CODE},
    results::QueryResult,
    sdam::ServerType,
    selection_criteria::ReadPreference,
    trace::COMMAND_TRACING_EVENT_TARGET,
    BoxFuture,
    Namespace,
};

/// Cursor options of a query.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct QueryOptions {
    /// The number of matching documents to skip.
    pub skip: i32,

    /// The maximum number of documents to return in total. A negative limit asks for a single
    /// batch of at most its absolute value, after which the cursor is closed.
    pub limit: i32,

    /// The number of documents per batch. Zero leaves the choice to the server.
    pub batch_size: i32,

    /// Limits the fields of the returned documents.
    #[builder(setter(strip_option))]
    pub projection: Option<Document>,

    /// Which members of a replica set the query may run on.
    #[builder(setter(strip_option))]
    pub read_preference: Option<ReadPreference>,

    /// Allow the query to run on a secondary.
    pub secondary_ok: bool,

    /// Keep the cursor open once the last document is read.
    pub tailable_cursor: bool,

    /// Block on a tailable cursor for more data rather than returning an empty batch.
    pub await_data: bool,

    /// Keep the cursor open even when idle.
    pub no_cursor_timeout: bool,

    /// Return partial results when some shards are down.
    pub partial: bool,

    /// Allow the server to replay the oplog efficiently.
    pub oplog_replay: bool,
}

impl QueryOptions {
    /// The legacy `numberToReturn`: how many documents the first reply should hold, negative
    /// when the server should close the cursor after it.
    pub(crate) fn number_to_return(&self) -> i32 {
        let (limit, batch_size) = (self.limit, self.batch_size);
        if limit < 0 {
            limit
        } else if limit == 0 {
            batch_size
        } else if batch_size == 0 {
            limit
        } else if batch_size < 0 {
            -(limit.saturating_abs().min(batch_size.saturating_abs()))
        } else {
            limit.min(batch_size)
        }
    }

    fn secondary_ok(&self) -> bool {
        self.secondary_ok
            || self
                .read_preference
                .as_ref()
                .map(ReadPreference::is_secondary_ok)
                .unwrap_or(false)
    }

    fn query_flags(&self) -> QueryFlags {
        let mut flags = QueryFlags::empty();
        flags.set(QueryFlags::SECONDARY_OK, self.secondary_ok());
        flags.set(QueryFlags::TAILABLE_CURSOR, self.tailable_cursor);
        flags.set(QueryFlags::AWAIT_DATA, self.await_data);
        flags.set(QueryFlags::NO_CURSOR_TIMEOUT, self.no_cursor_timeout);
        flags.set(QueryFlags::PARTIAL, self.partial);
        flags.set(QueryFlags::OPLOG_REPLAY, self.oplog_replay);
        flags
    }

    fn find_command(&self, namespace: &Namespace, filter: Document) -> Document {
        let mut command = doc! {
            "find": namespace.coll.as_str(),
            "filter": filter,
        };
        if self.skip > 0 {
            command.insert("skip", self.skip);
        }
        if self.limit < 0 {
            command.insert("limit", self.limit.saturating_abs());
            command.insert("singleBatch", true);
        } else if self.limit > 0 {
            command.insert("limit", self.limit);
        }
        if self.batch_size != 0 {
            command.insert("batchSize", self.batch_size.saturating_abs());
        }
        if let Some(ref projection) = self.projection {
            command.insert("projection", projection.clone());
        }
        for (name, set) in [
            ("tailable", self.tailable_cursor),
            ("awaitData", self.await_data),
            ("noCursorTimeout", self.no_cursor_timeout),
            ("allowPartialResults", self.partial),
            ("oplogReplay", self.oplog_replay),
        ] {
            if set {
                command.insert(name, true);
            }
        }
        command
    }
}

/// Runs a query and returns its first batch.
#[derive(Debug)]
pub struct QueryProtocol<D> {
    endpoint: Endpoint,
    namespace: Namespace,
    filter: Document,
    options: QueryOptions,
    decoder: D,
}

impl<D: Decoder> QueryProtocol<D> {
    /// Creates an executor querying `namespace` for documents matching `filter`.
    pub fn new(
        connection: Connection,
        namespace: Namespace,
        filter: Document,
        options: QueryOptions,
        decoder: D,
    ) -> Self {
        Self {
            endpoint: Endpoint::new(connection),
            namespace,
            filter,
            options,
            decoder,
        }
    }

    async fn run(&mut self) -> Result<QueryResult<D::Output>> {
        let connection = self.endpoint.connection();
        let description = connection.description();

        if description.supports_find_command() {
            let body = self.options.find_command(&self.namespace, self.filter.clone());
            let command = Command::new_read(
                "find",
                self.namespace.db.as_str(),
                self.options.read_preference.clone(),
                body,
            );
            let response = send_command(&self.endpoint, command).await?;
            return cursor_batch(&response, "firstBatch", &self.namespace, &self.decoder);
        }

        let options = &self.options;
        let mut query = self.filter.clone();
        if description.server_type == ServerType::Mongos {
            if let Some(read_preference) = options
                .read_preference
                .as_ref()
                .filter(|read_preference| read_preference.is_secondary_ok())
            {
                query = doc! {
                    "$query": query,
                    "$readPreference": read_preference.to_document()?,
                };
            }
        }

        let request = Request::Query(Query {
            flags: options.query_flags(),
            namespace: self.namespace.clone(),
            number_to_skip: options.skip,
            number_to_return: options.number_to_return(),
            query: bson_util::to_raw_document_buf(&query)?,
            return_fields_selector: options
                .projection
                .as_ref()
                .map(bson_util::to_raw_document_buf)
                .transpose()?,
        });
        let reply = expect_reply(
            connection
                .send_message(request, self.endpoint.context())
                .await?,
        )?;
        let results = classify_reply(&reply, &self.decoder, 0, connection.address())?;
        Ok(QueryResult::new(
            self.namespace.clone(),
            results,
            reply.cursor_id,
            connection.address().clone(),
        ))
    }
}

impl<D: Decoder> Protocol for QueryProtocol<D> {
    type Output = QueryResult<D::Output>;

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }

    fn exchange(&mut self) -> BoxFuture<'_, Result<Self::Output>> {
        self.run().boxed()
    }
}

/// Fetches the next batch of an open cursor.
#[derive(Debug)]
pub struct GetMoreProtocol<D> {
    endpoint: Endpoint,
    namespace: Namespace,
    cursor_id: i64,
    number_to_return: i32,
    decoder: D,
}

impl<D: Decoder> GetMoreProtocol<D> {
    /// Creates an executor fetching up to `number_to_return` documents of the cursor
    /// `cursor_id`. Zero leaves the batch size to the server.
    pub fn new(
        connection: Connection,
        namespace: Namespace,
        cursor_id: i64,
        number_to_return: i32,
        decoder: D,
    ) -> Self {
        Self {
            endpoint: Endpoint::new(connection),
            namespace,
            cursor_id,
            number_to_return,
            decoder,
        }
    }

    async fn run(&mut self) -> Result<QueryResult<D::Output>> {
        let connection = self.endpoint.connection();

        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            cursorId = self.cursor_id,
            namespace = %self.namespace,
            driverConnectionId = connection.id().local_value(),
            serverHost = connection.address().host(),
            serverPort = connection.address().port(),
            "Getting more documents",
        );

        let result = if connection.description().supports_find_command() {
            let mut body = doc! {
                "getMore": self.cursor_id,
                "collection": self.namespace.coll.as_str(),
            };
            if self.number_to_return != 0 {
                body.insert("batchSize", self.number_to_return.saturating_abs());
            }
            let command = Command::new("getMore", self.namespace.db.as_str(), body);
            let response = send_command(&self.endpoint, command)
                .await
                .map_err(|error| {
                    if error.code() == Some(CURSOR_NOT_FOUND_CODE) {
                        Error::cursor_not_found(self.cursor_id, connection.address().clone())
                    } else {
                        error
                    }
                })?;
            cursor_batch(&response, "nextBatch", &self.namespace, &self.decoder)?
        } else {
            let request = Request::GetMore(GetMore {
                namespace: self.namespace.clone(),
                number_to_return: self.number_to_return,
                cursor_id: self.cursor_id,
            });
            let reply = expect_reply(
                connection
                    .send_message(request, self.endpoint.context())
                    .await?,
            )?;
            let results =
                classify_reply(&reply, &self.decoder, self.cursor_id, connection.address())?;
            QueryResult::new(
                self.namespace.clone(),
                results,
                reply.cursor_id,
                connection.address().clone(),
            )
        };

        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            cursorId = self.cursor_id,
            returned = result.results.len(),
            exhausted = !result.has_more(),
            "Get-more completed",
        );
        Ok(result)
    }
}

impl<D: Decoder> Protocol for GetMoreProtocol<D> {
    type Output = QueryResult<D::Output>;

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }

    fn exchange(&mut self) -> BoxFuture<'_, Result<Self::Output>> {
        self.run().boxed()
    }
}

/// Kills open cursors. The server's verdict is logged, never returned; only failing to reach
/// the server is an error.
#[derive(Clone, Debug)]
pub struct KillCursorsProtocol {
    endpoint: Endpoint,
    namespace: Namespace,
    cursor_ids: Vec<i64>,
}

impl KillCursorsProtocol {
    /// Creates an executor killing `cursor_ids`, which were opened on `namespace`.
    pub fn new(connection: Connection, namespace: Namespace, cursor_ids: Vec<i64>) -> Self {
        Self {
            endpoint: Endpoint::new(connection),
            namespace,
            cursor_ids,
        }
    }

    async fn run(&mut self) -> Result<()> {
        if self.cursor_ids.is_empty() {
            return Ok(());
        }
        let connection = self.endpoint.connection();

        if !connection.description().supports_find_command() {
            let request = Request::KillCursors(KillCursors {
                cursor_ids: self.cursor_ids.clone(),
            });
            connection
                .send_message(request, self.endpoint.context())
                .await?;
            return Ok(());
        }

        let command = Command::new(
            "killCursors",
            self.namespace.db.as_str(),
            doc! {
                "killCursors": self.namespace.coll.as_str(),
                "cursors": self.cursor_ids.clone(),
            },
        );
        match send_command(&self.endpoint, command).await {
            Ok(_) => Ok(()),
            Err(error) if error.is_network_error() || connection.is_closed() => Err(error),
            Err(error) => {
                tracing::debug!(
                    target: COMMAND_TRACING_EVENT_TARGET,
                    namespace = %self.namespace,
                    cursorIds = ?self.cursor_ids,
                    failure = %error,
                    "killCursors failed",
                );
                Ok(())
            }
        }
    }
}

impl Protocol for KillCursorsProtocol {
    type Output = ();

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }

    fn exchange(&mut self) -> BoxFuture<'_, Result<Self::Output>> {
        self.run().boxed()
    }
}

/// Sends a command that expects a reply and fails if the server reports an error.
async fn send_command(endpoint: &Endpoint, command: Command) -> Result<CommandResponse> {
    let connection = endpoint.connection();
    let request = command.into_request(connection.description())?;
    let response = connection
        .send_message(request, endpoint.context())
        .await?
        .ok_or_else(|| Error::internal("a command completed without a reply"))?;
    let response = CommandResponse::new(endpoint.address().clone(), response)?;
    response.validate()?;
    Ok(response)
}

/// Reads the `cursor` subdocument of a `find` or `getMore` reply.
fn cursor_batch<D: Decoder>(
    response: &CommandResponse,
    batch_field: &str,
    requested: &Namespace,
    decoder: &D,
) -> Result<QueryResult<D::Output>> {
    let cursor = response.raw_response.get_document("cursor")?;
    let cursor_id = cursor.get_i64("id")?;
    let namespace = match cursor.get_str("ns") {
        Ok(ns) => ns.parse().unwrap_or_else(|_| requested.clone()),
        Err(_) => requested.clone(),
    };

    let results = cursor
        .get_array(batch_field)?
        .into_iter()
        .map(|element| {
            let document: &RawDocument = element?.as_document().ok_or_else(|| {
                Error::invalid_response(format!("{} holds a non-document entry", batch_field))
            })?;
            decoder.decode(document)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(QueryResult::new(
        namespace,
        results,
        cursor_id,
        response.source.clone(),
    ))
}
