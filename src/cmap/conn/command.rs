use serde::Deserialize;

use super::{
    wire::{DocumentSequence, Header, Message, MessageFlags, Query, QueryFlags, Request, Response},
    ConnectionDescription,
};
use crate::{
    bson::{self, Bson, Document, RawDocumentBuf, Timestamp},
    bson_util,
    codec::Decoder,
    error::{
        CommandError,
        Error,
        ErrorKind,
        Result,
        WriteConcernError,
        WriteError,
        WriteFailure,
    },
    options::{ServerAddress, ServerApi},
    results::WriteConcernResult,
    sdam::ServerType,
    selection_criteria::ReadPreference,
    session::{ClusterTime, SessionContext},
    Namespace,
};

/// Room the server leaves on top of the maximum document size for the command wrapping it.
pub(crate) const COMMAND_OVERHEAD_SIZE: usize = 16 * 1024;

/// `Command` is a driver side abstraction of a server command containing all the information
/// necessary to serialize it to a wire message.
#[derive(Debug, Clone)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
    pub(crate) read_pref: Option<ReadPreference>,
    pub(crate) document_sequences: Vec<DocumentSequence>,
    pub(crate) response_expected: bool,
}

impl Command {
    /// Constructs a new command.
    pub(crate) fn new(name: impl Into<String>, target_db: impl Into<String>, body: Document) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
            read_pref: None,
            document_sequences: Vec::new(),
            response_expected: true,
        }
    }

    /// Constructs a read command.
    pub(crate) fn new_read(
        name: impl Into<String>,
        target_db: impl Into<String>,
        read_pref: Option<ReadPreference>,
        body: Document,
    ) -> Self {
        Self {
            read_pref,
            ..Self::new(name, target_db, body)
        }
    }

    /// Builds a command from a caller-supplied document, whose first key names the command.
    pub(crate) fn from_document(
        target_db: impl Into<String>,
        body: Document,
        read_pref: Option<ReadPreference>,
    ) -> Result<Self> {
        let name = bson_util::first_key(&body)
            .ok_or_else(|| Error::invalid_argument("an empty document cannot be run as a command"))?
            .to_string();
        Ok(Self::new_read(name, target_db, read_pref, body))
    }

    pub(crate) fn set_session(&mut self, context: &dyn SessionContext) {
        if let Some(id) = context.session_id() {
            self.body.insert("lsid", id);
        }
        if let Some(cluster_time) = context.cluster_time() {
            // this should never fail.
            if let Ok(document) = bson::to_bson(&cluster_time) {
                self.body.insert("$clusterTime", document);
            }
        }
    }

    pub(crate) fn set_server_api(&mut self, server_api: &ServerApi) {
        server_api.append_to(&mut self.body);
    }

    /// Frames the command for the dialect `description` speaks: OP_MSG for wire version 6 and
    /// newer, OP_QUERY against `<db>.$cmd` otherwise.
    pub(crate) fn into_request(mut self, description: &ConnectionDescription) -> Result<Request> {
        let non_primary_read_pref = self
            .read_pref
            .as_ref()
            .filter(|read_pref| read_pref.is_secondary_ok());

        if description.supports_op_msg() {
            self.body.insert("$db", self.target_db.as_str());
            if let Some(read_pref) = non_primary_read_pref {
                if description.server_type != ServerType::Standalone {
                    self.body.insert("$readPreference", read_pref.to_document()?);
                }
            }

            let document_payload = bson_util::to_raw_document_buf(&self.body)?;
            check_command_size(&document_payload, description)?;

            let flags = if self.response_expected {
                MessageFlags::empty()
            } else {
                MessageFlags::MORE_TO_COME
            };
            let mut message = Message::new(document_payload, flags);
            message.document_sequences = self.document_sequences;
            return Ok(Request::Message(message));
        }

        for sequence in self.document_sequences {
            let documents = sequence
                .documents
                .iter()
                .map(|document| Ok(Bson::Document(document.to_document()?)))
                .collect::<Result<Vec<_>>>()?;
            self.body.insert(sequence.identifier, documents);
        }

        let mut flags = QueryFlags::empty();
        let query = match non_primary_read_pref {
            Some(read_pref) => {
                flags |= QueryFlags::SECONDARY_OK;
                if description.server_type == ServerType::Mongos {
                    bson::doc! {
                        "$query": self.body,
                        "$readPreference": read_pref.to_document()?,
                    }
                } else {
                    self.body
                }
            }
            None => self.body,
        };

        let query = bson_util::to_raw_document_buf(&query)?;
        check_command_size(&query, description)?;

        Ok(Request::Query(Query {
            flags,
            namespace: Namespace::command(self.target_db),
            number_to_skip: 0,
            number_to_return: -1,
            query,
            return_fields_selector: None,
        }))
    }
}

fn check_command_size(document: &RawDocumentBuf, description: &ConnectionDescription) -> Result<()> {
    let max = description.max_document_size_bytes() + COMMAND_OVERHEAD_SIZE;
    if document.as_bytes().len() > max {
        return Err(Error::invalid_argument(format!(
            "command document of {} bytes exceeds the maximum of {} bytes",
            document.as_bytes().len(),
            max
        )));
    }
    Ok(())
}

/// A command reply, tied to the server that sent it.
#[derive(Debug, Clone)]
pub(crate) struct CommandResponse {
    pub(crate) source: ServerAddress,
    pub(crate) raw_response: RawDocumentBuf,
}

impl CommandResponse {
    /// Extracts the reply document from either framing. A legacy reply carrying the query failure
    /// flag is an error in its own right.
    pub(crate) fn new(source: ServerAddress, response: Response) -> Result<Self> {
        let raw_response = match response {
            Response::Message(message) => message.document_payload,
            Response::Reply(reply) => {
                let query_failure = reply
                    .flags
                    .contains(super::wire::ResponseFlags::QUERY_FAILURE);
                let first = reply.documents.into_iter().next().ok_or_else(|| {
                    Error::invalid_response("the server replied to a command with no document")
                })?;
                if query_failure {
                    return Err(Error::query_failure(&source, first.to_document()?));
                }
                first
            }
        };
        Ok(Self {
            source,
            raw_response,
        })
    }

    /// Returns whether this response indicates a success or not (i.e. if "ok: 1")
    pub(crate) fn is_success(&self) -> bool {
        match self.raw_response.get("ok") {
            Ok(Some(ok)) => bson_util::get_int_raw(ok) == Some(1),
            _ => false,
        }
    }

    /// Returns a result indicating whether this response corresponds to a command failure.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }
        let command_error = CommandError::from_document(self.raw_response.to_document()?);
        Err(ErrorKind::Command(command_error).into())
    }

    /// Gets the cluster time from the response, if any.
    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.raw_response
            .get_document("$clusterTime")
            .ok()
            .and_then(|document| bson::from_slice(document.as_bytes()).ok())
    }

    /// Gets the operation time from the response, if any.
    pub(crate) fn operation_time(&self) -> Option<Timestamp> {
        self.raw_response.get_timestamp("operationTime").ok()
    }

    /// Records the times the server reported in the session the command ran under.
    pub(crate) fn update_session(&self, context: &dyn SessionContext) {
        if let Some(cluster_time) = self.cluster_time() {
            context.advance_cluster_time(&cluster_time);
        }
        if let Some(operation_time) = self.operation_time() {
            context.advance_operation_time(operation_time);
        }
    }

    pub(crate) fn decode<D: Decoder>(&self, decoder: &D) -> Result<D::Output> {
        decoder.decode(&self.raw_response)
    }

    /// Interprets the reply to an `insert`, `update` or `delete` command.
    pub(crate) fn write_concern_result(&self, is_update: bool) -> Result<WriteConcernResult> {
        self.validate()?;
        let body: WriteResponseBody = bson::from_slice(self.raw_response.as_bytes())?;

        if let Some(write_error) = body.write_errors.and_then(|errors| errors.into_iter().next()) {
            return Err(ErrorKind::Write(WriteFailure::WriteError(write_error)).into());
        }
        if let Some(write_concern_error) = body.write_concern_error {
            return Err(ErrorKind::Write(WriteFailure::WriteConcernError(write_concern_error)).into());
        }

        let upserted_id = body
            .upserted
            .and_then(|upserted| upserted.into_iter().next())
            .map(|upserted| upserted.id);
        let update_of_existing = is_update && body.n > 0 && upserted_id.is_none();
        Ok(WriteConcernResult::acknowledged(
            body.n,
            update_of_existing,
            upserted_id,
        ))
    }

    /// Interprets the reply to a `getlasterror` sent after a legacy write.
    pub(crate) fn get_last_error_result(&self) -> Result<WriteConcernResult> {
        self.validate()?;
        let body: GetLastErrorBody = bson::from_slice(self.raw_response.as_bytes())?;

        if let Some(message) = body.err {
            let code = body.code.unwrap_or(UNKNOWN_ERROR_CODE);
            if body.wtimeout || code == WRITE_CONCERN_FAILED_CODE {
                return Err(ErrorKind::Write(WriteFailure::WriteConcernError(WriteConcernError {
                    code,
                    code_name: body.code_name.unwrap_or_default(),
                    message,
                    details: None,
                }))
                .into());
            }
            return Err(ErrorKind::Write(WriteFailure::WriteError(WriteError {
                index: 0,
                code,
                code_name: body.code_name,
                message,
            }))
            .into());
        }

        Ok(WriteConcernResult::acknowledged(
            body.n,
            body.updated_existing,
            body.upserted,
        ))
    }
}

const UNKNOWN_ERROR_CODE: i32 = 8;
const WRITE_CONCERN_FAILED_CODE: i32 = 64;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteResponseBody {
    #[serde(default)]
    n: u64,

    upserted: Option<Vec<Upserted>>,

    write_errors: Option<Vec<WriteError>>,

    write_concern_error: Option<WriteConcernError>,
}

#[derive(Debug, Deserialize)]
struct Upserted {
    #[serde(rename = "_id")]
    id: Bson,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetLastErrorBody {
    err: Option<String>,

    code: Option<i32>,

    code_name: Option<String>,

    #[serde(default)]
    n: u64,

    #[serde(default)]
    updated_existing: bool,

    upserted: Option<Bson>,

    #[serde(default)]
    wtimeout: bool,
}

/// The kind of write carried by a [`SplittablePayload`], which names the document sequence the
/// documents travel in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum PayloadKind {
    /// Documents to insert.
    Insert,

    /// Update statements.
    Update,

    /// Delete statements.
    Delete,
}

impl PayloadKind {
    /// The name of the command field the documents belong to.
    pub fn identifier(self) -> &'static str {
        match self {
            Self::Insert => "documents",
            Self::Update => "updates",
            Self::Delete => "deletes",
        }
    }
}

/// A batch of write documents that may not fit in a single message.
///
/// Each command sent with the payload consumes as many documents as fit, starting at
/// [`position`](SplittablePayload::position); the position then advances past the documents that
/// were sent. Callers resend the same command while
/// [`has_another_split`](SplittablePayload::has_another_split) returns `true`.
#[derive(Clone, Debug)]
pub struct SplittablePayload {
    kind: PayloadKind,
    documents: Vec<RawDocumentBuf>,
    position: usize,
}

impl SplittablePayload {
    /// Creates a payload of `documents`.
    pub fn new(kind: PayloadKind, documents: impl IntoIterator<Item = Document>) -> Result<Self> {
        let documents = documents
            .into_iter()
            .map(|document| bson_util::to_raw_document_buf(&document))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            kind,
            documents,
            position: 0,
        })
    }

    /// An empty stand-in, held while the real payload is lent to an exchange.
    pub(crate) fn placeholder(kind: PayloadKind) -> Self {
        Self {
            kind,
            documents: Vec::new(),
            position: 0,
        }
    }

    /// The kind of write the payload carries.
    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    /// The index of the first document not yet sent.
    pub fn position(&self) -> usize {
        self.position
    }

    /// The total number of documents in the payload.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Whether the payload has no documents at all.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Whether documents remain to be sent.
    pub fn has_another_split(&self) -> bool {
        self.position < self.documents.len()
    }

    /// Takes the next batch, bounded by the message size left over once `command` is framed and
    /// by the write batch count limit. Nothing is consumed until [`advance`](Self::advance).
    pub(crate) fn next_batch(
        &self,
        command: &Document,
        description: &ConnectionDescription,
    ) -> Result<DocumentSequence> {
        let identifier = self.kind.identifier();
        let command_length = bson_util::to_raw_document_buf(command)?.as_bytes().len();

        // header, flags, the type 0 section and the type 1 section's kind, size and identifier
        let framing = Header::LENGTH
            + std::mem::size_of::<u32>()
            + 1
            + command_length
            + 1
            + std::mem::size_of::<i32>()
            + identifier.len()
            + 1
            + COMMAND_OVERHEAD_SIZE;
        // Legacy framing embeds the batch in the command document itself.
        let budget = if description.supports_op_msg() {
            description.max_message_size_bytes().saturating_sub(framing)
        } else {
            // element type, key terminator, array length and array terminator
            description
                .max_document_size_bytes()
                .saturating_sub(command_length + 1 + identifier.len() + 1 + 4 + 1)
        };

        let mut documents = Vec::new();
        let mut size = 0;
        for (offset, document) in self.documents[self.position..].iter().enumerate() {
            let length = document.as_bytes().len();
            if length > description.max_document_size_bytes() {
                return Err(Error::invalid_argument(format!(
                    "document at index {} is {} bytes, over the maximum of {} bytes",
                    self.position + offset,
                    length,
                    description.max_document_size_bytes()
                )));
            }

            // An embedded array costs a key per entry.
            let entry_size = if description.supports_op_msg() {
                length
            } else {
                bson_util::array_entry_size_bytes(offset, length)
            };
            if documents.len() == description.max_write_batch_size
                || size + entry_size > budget
            {
                break;
            }
            size += entry_size;
            documents.push(document.clone());
        }

        if documents.is_empty() && self.has_another_split() {
            return Err(Error::invalid_argument(
                "the next document of the payload does not fit in a message",
            ));
        }

        Ok(DocumentSequence {
            identifier: identifier.to_string(),
            documents,
        })
    }

    pub(crate) fn advance(&mut self, count: usize) {
        self.position = (self.position + count).min(self.documents.len());
    }
}
