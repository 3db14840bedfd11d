//! Contains the `Error` and `Result` types that `mongodb_binding` uses.

use std::{collections::HashSet, fmt, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    bson::{Bson, Document},
    bson_util,
    options::ServerAddress,
    results::ServerCursor,
};

/// The label attached to errors that were caused by the network layer.
pub const NETWORK_ERROR: &str = "NetworkError";

/// The server error code reporting that a cursor is no longer available.
pub(crate) const CURSOR_NOT_FOUND_CODE: i32 = 43;

/// The result type for all methods that can return an error in the `mongodb_binding` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `mongodb_binding` crate. The inner [`ErrorKind`] is boxed to
/// keep results small, and errors can be cloned so that they can be handed to callbacks.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    labels: HashSet<String>,
}

impl Error {
    /// Create a new `Error` wrapping the given kind and labels.
    pub fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let mut labels: HashSet<String> = labels
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();
        if kind.is_network_error() {
            labels.insert(NETWORK_ERROR.to_string());
        }
        if let ErrorKind::Command(ref command_error) = kind {
            labels.extend(command_error.labels.iter().cloned());
        }
        Self {
            kind: Box::new(kind),
            labels,
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Self {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn lifecycle(message: impl Into<String>) -> Self {
        ErrorKind::ResourceLifecycle {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn connection_closed(message: impl Into<String>) -> Self {
        ErrorKind::ConnectionClosed {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn server_selection(message: impl Into<String>) -> Self {
        ErrorKind::ServerSelection {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn cursor_not_found(cursor_id: i64, address: ServerAddress) -> Self {
        ErrorKind::CursorNotFound {
            cursor: ServerCursor::new(cursor_id, address),
        }
        .into()
    }

    /// Builds the error for a server-reported query or command failure from its error document.
    pub(crate) fn query_failure(address: &ServerAddress, document: Document) -> Self {
        let command_error = CommandError::from_document(document);
        tracing::debug!(
            target: crate::trace::COMMAND_TRACING_EVENT_TARGET,
            serverHost = address.host(),
            serverPort = address.port(),
            code = command_error.code,
            "Server reported a failure: {}",
            command_error.message,
        );
        ErrorKind::Command(command_error).into()
    }

    /// Whether this error was caused by a failure in the network layer.
    pub fn is_network_error(&self) -> bool {
        self.kind.is_network_error()
    }

    /// Whether the server reported that the cursor used by the operation no longer exists.
    pub fn is_cursor_not_found(&self) -> bool {
        matches!(*self.kind, ErrorKind::CursorNotFound { .. })
    }

    /// Whether no suitable server could be selected for the operation.
    pub fn is_server_selection_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::ServerSelection { .. })
    }

    /// Whether this error reports a misuse of a reference-counted resource, such as releasing it
    /// more times than it was retained.
    pub fn is_resource_lifecycle_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::ResourceLifecycle { .. })
    }

    /// The server error code, if the server reported one.
    pub fn code(&self) -> Option<i32> {
        match *self.kind {
            ErrorKind::Command(ref err) => Some(err.code),
            ErrorKind::Write(WriteFailure::WriteError(ref err)) => Some(err.code),
            ErrorKind::Write(WriteFailure::WriteConcernError(ref err)) => Some(err.code),
            _ => None,
        }
    }

    /// Returns the labels for this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    /// Adds the given label to this error.
    pub(crate) fn add_label<T: AsRef<str>>(&mut self, label: T) {
        self.labels.insert(label.as_ref().to_string());
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

impl std::ops::Deref for Error {
    type Target = ErrorKind;

    fn deref(&self) -> &Self::Target {
        &self.kind
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(crate::bson::de::Error),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(crate::bson::ser::Error),

    /// The server returned an error to an attempted command or query.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// The server reported that the cursor does not exist, typically because it timed out or
    /// was killed.
    #[error("Cursor {} not found on server {}", cursor.id(), cursor.address())]
    #[non_exhaustive]
    CursorNotFound { cursor: ServerCursor },

    /// An error occurred when trying to execute a write operation.
    #[error("An error occurred when trying to execute a write operation: {0:?}")]
    Write(WriteFailure),

    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The server returned an invalid reply to a database operation.
    #[error("The server returned an invalid reply to a database operation: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// No server suitable for the operation could be selected in time.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// The connection was closed, either because an earlier network or protocol error made it
    /// unusable or because it was closed explicitly.
    #[error("The connection is closed: {message}")]
    #[non_exhaustive]
    ConnectionClosed { message: String },

    /// A reference-counted resource was misused: released more often than retained, retained
    /// after its count reached zero, or used after being released.
    #[error("Reference count violation: {message}")]
    #[non_exhaustive]
    ResourceLifecycle { message: String },

    /// An internal error occurred.
    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },
}

impl From<crate::bson::de::Error> for ErrorKind {
    fn from(err: crate::bson::de::Error) -> Self {
        Self::BsonDeserialization(err)
    }
}

impl From<crate::bson::ser::Error> for ErrorKind {
    fn from(err: crate::bson::ser::Error) -> Self {
        Self::BsonSerialization(err)
    }
}

impl From<crate::bson::raw::Error> for ErrorKind {
    fn from(err: crate::bson::raw::Error) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

impl From<crate::bson::raw::ValueAccessError> for ErrorKind {
    fn from(err: crate::bson::raw::ValueAccessError) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

impl ErrorKind {
    pub(crate) fn is_network_error(&self) -> bool {
        matches!(self, ErrorKind::Io(..))
    }
}

/// An error that occurred due to a database command or query failing.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    #[serde(default = "unknown_code")]
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", alias = "$err", default)]
    pub message: String,

    /// The error labels that the server returned.
    #[serde(rename = "errorLabels", default)]
    pub labels: Vec<String>,

    /// The full error document the server returned.
    #[serde(skip)]
    pub document: Document,
}

fn unknown_code() -> i32 {
    -1
}

impl CommandError {
    /// Builds a `CommandError` from a generic error document, tolerating missing or oddly-typed
    /// fields so the original document is never lost.
    pub(crate) fn from_document(document: Document) -> Self {
        let code = document
            .get("code")
            .and_then(bson_util::get_int)
            .and_then(|code| i32::try_from(code).ok())
            .unwrap_or_else(unknown_code);
        let message = document
            .get_str("errmsg")
            .or_else(|_| document.get_str("$err"))
            .unwrap_or_default()
            .to_string();
        let code_name = document.get_str("codeName").unwrap_or_default().to_string();
        let labels = match document.get("errorLabels") {
            Some(Bson::Array(labels)) => labels
                .iter()
                .filter_map(|label| label.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        };
        Self {
            code,
            code_name,
            message,
            labels,
            document,
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Error code {} ({}): {}", self.code, self.code_name, self.message)
    }
}

/// An error that occurred due to not being able to satisfy a write concern.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct WriteConcernError {
    /// Identifies the type of write concern error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,

    /// A document identifying the write concern setting related to the error.
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,
}

/// An error that occurred during a write operation that wasn't due to being unable to satisfy a
/// write concern.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct WriteError {
    /// The index of the failed write within its batch.
    #[serde(default)]
    pub index: usize,

    /// Identifies the type of write error.
    pub code: i32,

    /// The name associated with the error code.
    ///
    /// Note that the server will not return this in some cases, hence `code_name` being an
    /// `Option`.
    #[serde(rename = "codeName", default)]
    pub code_name: Option<String>,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

/// An error that occurred when trying to execute a write operation.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum WriteFailure {
    /// An error that occurred due to not being able to satisfy a write concern.
    WriteConcernError(WriteConcernError),

    /// An error that occurred during a write operation that wasn't due to being unable to satisfy a
    /// write concern.
    WriteError(WriteError),
}

#[cfg(test)]
mod test {
    use crate::{
        bson::doc,
        error::{CommandError, Error, ErrorKind, NETWORK_ERROR},
    };

    #[test]
    fn network_errors_are_labeled() {
        let error: Error = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(error.is_network_error());
        assert!(error.contains_label(NETWORK_ERROR));
    }

    #[test]
    fn command_error_from_partial_document() {
        let document = doc! { "$err": "bad query", "ok": 0 };
        let error = CommandError::from_document(document.clone());
        assert_eq!(error.code, -1);
        assert_eq!(error.message, "bad query");
        assert_eq!(error.document, document);

        let error = CommandError::from_document(doc! {
            "ok": 0,
            "code": 11000_i64,
            "errmsg": "duplicate key",
            "errorLabels": ["RetryableWriteError"],
        });
        assert_eq!(error.code, 11000);

        let error: Error = ErrorKind::Command(error).into();
        assert_eq!(error.code(), Some(11000));
        assert!(error.contains_label("RetryableWriteError"));
    }
}
