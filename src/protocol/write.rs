use futures_util::FutureExt;
use typed_builder::TypedBuilder;

use super::{Endpoint, Protocol};
use crate::{
    bson::{doc, Bson, Document},
    bson_util,
    cmap::{
        conn::wire::{Delete, Insert, Request, Update, UpdateFlags},
        Command,
        CommandResponse,
        Connection,
    },
    concern::WriteConcern,
    error::{Error, Result},
    results::WriteConcernResult,
    validation::{
        validate_document,
        CollectibleDocumentFieldNameValidator,
        ReplacingDocumentFieldNameValidator,
        UpdateFieldNameValidator,
    },
    BoxFuture,
    Namespace,
};

/// A single document to insert.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct InsertRequest {
    /// The document to insert.
    pub document: Document,
}

impl InsertRequest {
    /// Creates a request inserting `document`.
    pub fn new(document: Document) -> Self {
        Self { document }
    }
}

/// Whether an [`UpdateRequest`] applies update operators or replaces the matched document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum UpdateKind {
    /// The update document consists of update operators such as `$set`.
    #[default]
    Update,

    /// The update document replaces the matched document.
    Replace,
}

/// A single update statement.
#[derive(Clone, Debug, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct UpdateRequest {
    /// Selects the documents to update.
    #[builder(!default)]
    pub filter: Document,

    /// The update operators, or the replacement document.
    #[builder(!default)]
    pub update: Document,

    /// Insert a document built from the filter and update when nothing matches.
    pub upsert: bool,

    /// Update every matching document rather than the first.
    pub multi: bool,

    /// How `update` is interpreted.
    pub kind: UpdateKind,
}

/// A single delete statement.
#[derive(Clone, Debug, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct DeleteRequest {
    /// Selects the documents to delete.
    #[builder(!default)]
    pub filter: Document,

    /// Delete every matching document rather than the first.
    pub multi: bool,
}

/// The three write kinds share one exchange; only the statement and the legacy opcode differ.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteKind {
    Insert,
    Update,
    Delete,
}

impl WriteKind {
    fn command_name(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    fn statements_field(self) -> &'static str {
        match self {
            Self::Insert => "documents",
            Self::Update => "updates",
            Self::Delete => "deletes",
        }
    }
}

struct Write<'a> {
    endpoint: &'a Endpoint,
    namespace: &'a Namespace,
    ordered: bool,
    write_concern: &'a WriteConcern,
    kind: WriteKind,
    statement: Document,
}

impl Write<'_> {
    /// Sends the write as a command on servers that understand write commands, and otherwise as
    /// the legacy opcode `legacy` builds, followed by `getlasterror` when acknowledgement is
    /// requested.
    async fn execute(self, legacy: impl FnOnce() -> Result<Request>) -> Result<WriteConcernResult> {
        self.write_concern.validate()?;
        let connection = self.endpoint.connection();
        let description = connection.description();
        let acknowledged = self.write_concern.is_acknowledged();

        if description.supports_write_commands() {
            let mut body = doc! {
                self.kind.command_name(): self.namespace.coll.as_str(),
                "ordered": self.ordered,
                self.kind.statements_field(): [Bson::Document(self.statement)],
            };
            if !self.write_concern.is_empty() {
                body.insert("writeConcern", crate::bson::to_document(self.write_concern)?);
            }

            let mut command = Command::new(self.kind.command_name(), &self.namespace.db, body);
            command.response_expected = acknowledged;
            let request = command.into_request(description)?;

            let Some(response) = connection
                .send_message(request, self.endpoint.context())
                .await?
            else {
                return Ok(WriteConcernResult::unacknowledged());
            };
            let response = CommandResponse::new(connection.address().clone(), response)?;
            return response.write_concern_result(self.kind == WriteKind::Update);
        }

        connection
            .send_message(legacy()?, self.endpoint.context())
            .await?;
        if !acknowledged {
            return Ok(WriteConcernResult::unacknowledged());
        }

        let get_last_error = Command::new(
            "getlasterror",
            &self.namespace.db,
            self.write_concern.get_last_error_command()?,
        );
        let response = connection
            .send_message(
                get_last_error.into_request(description)?,
                self.endpoint.context(),
            )
            .await?
            .ok_or_else(|| Error::internal("getlasterror completed without a reply"))?;
        let mut result =
            CommandResponse::new(connection.address().clone(), response)?.get_last_error_result()?;

        // getlasterror reports n = 0 for inserts.
        if self.kind == WriteKind::Insert {
            result.count = 1;
        }
        Ok(result)
    }
}

fn check_document_size(document: &Document, connection: &Connection) -> Result<()> {
    let length = bson_util::to_raw_document_buf(document)?.as_bytes().len();
    let max = connection.description().max_document_size_bytes();
    if length > max {
        return Err(Error::invalid_argument(format!(
            "document of {} bytes exceeds the maximum document size of {} bytes",
            length, max
        )));
    }
    Ok(())
}

macro_rules! write_protocol {
    ($(#[$attr:meta])* $name:ident, $request:ty) => {
        $(#[$attr])*
        #[derive(Clone, Debug)]
        pub struct $name {
            endpoint: Endpoint,
            namespace: Namespace,
            ordered: bool,
            write_concern: WriteConcern,
            request: $request,
        }

        impl $name {
            /// Creates an executor acknowledging the write with the server's default write
            /// concern.
            pub fn new(
                connection: Connection,
                namespace: Namespace,
                ordered: bool,
                request: $request,
            ) -> Self {
                Self {
                    endpoint: Endpoint::new(connection),
                    namespace,
                    ordered,
                    write_concern: WriteConcern::default(),
                    request,
                }
            }

            /// Sets the write concern the write is acknowledged with. An unacknowledged write
            /// concern makes the executor return without waiting for the server.
            pub fn write_concern(mut self, write_concern: WriteConcern) -> Self {
                self.write_concern = write_concern;
                self
            }
        }
    };
}

write_protocol!(
    /// Inserts one document.
    InsertProtocol,
    InsertRequest
);

write_protocol!(
    /// Applies one update statement.
    UpdateProtocol,
    UpdateRequest
);

write_protocol!(
    /// Applies one delete statement.
    DeleteProtocol,
    DeleteRequest
);

impl Protocol for InsertProtocol {
    type Output = WriteConcernResult;

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }

    fn exchange(&mut self) -> BoxFuture<'_, Result<Self::Output>> {
        async move {
            let document = &self.request.document;
            validate_document(document, &CollectibleDocumentFieldNameValidator)?;
            check_document_size(document, self.endpoint.connection())?;

            let write = Write {
                endpoint: &self.endpoint,
                namespace: &self.namespace,
                ordered: self.ordered,
                write_concern: &self.write_concern,
                kind: WriteKind::Insert,
                statement: document.clone(),
            };
            write
                .execute(|| {
                    Ok(Request::Insert(Insert {
                        continue_on_error: !self.ordered,
                        namespace: self.namespace.clone(),
                        documents: vec![bson_util::to_raw_document_buf(document)?],
                    }))
                })
                .await
        }
        .boxed()
    }
}

impl Protocol for UpdateProtocol {
    type Output = WriteConcernResult;

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }

    fn exchange(&mut self) -> BoxFuture<'_, Result<Self::Output>> {
        async move {
            let request = &self.request;
            match request.kind {
                UpdateKind::Update => validate_document(&request.update, &UpdateFieldNameValidator)?,
                UpdateKind::Replace => {
                    validate_document(&request.update, &ReplacingDocumentFieldNameValidator)?;
                    check_document_size(&request.update, self.endpoint.connection())?;
                }
            }

            let write = Write {
                endpoint: &self.endpoint,
                namespace: &self.namespace,
                ordered: self.ordered,
                write_concern: &self.write_concern,
                kind: WriteKind::Update,
                statement: doc! {
                    "q": request.filter.clone(),
                    "u": request.update.clone(),
                    "upsert": request.upsert,
                    "multi": request.multi,
                },
            };
            write
                .execute(|| {
                    let mut flags = UpdateFlags::empty();
                    flags.set(UpdateFlags::UPSERT, request.upsert);
                    flags.set(UpdateFlags::MULTI_UPDATE, request.multi);
                    Ok(Request::Update(Update {
                        namespace: self.namespace.clone(),
                        flags,
                        selector: bson_util::to_raw_document_buf(&request.filter)?,
                        update: bson_util::to_raw_document_buf(&request.update)?,
                    }))
                })
                .await
        }
        .boxed()
    }
}

impl Protocol for DeleteProtocol {
    type Output = WriteConcernResult;

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }

    fn exchange(&mut self) -> BoxFuture<'_, Result<Self::Output>> {
        async move {
            let request = &self.request;
            let limit = if request.multi { 0 } else { 1 };
            let write = Write {
                endpoint: &self.endpoint,
                namespace: &self.namespace,
                ordered: self.ordered,
                write_concern: &self.write_concern,
                kind: WriteKind::Delete,
                statement: doc! { "q": request.filter.clone(), "limit": limit },
            };
            write
                .execute(|| {
                    Ok(Request::Delete(Delete {
                        namespace: self.namespace.clone(),
                        single_remove: !request.multi,
                        selector: bson_util::to_raw_document_buf(&request.filter)?,
                    }))
                })
                .await
        }
        .boxed()
    }
}
