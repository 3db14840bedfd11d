//! Contains the types of results returned by the protocol executors.

use serde::{Deserialize, Serialize};

use crate::{bson::Bson, options::ServerAddress, Namespace};

/// The outcome of a single insert, update or delete, as reported by the server's acknowledgement.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct WriteConcernResult {
    /// Whether the server acknowledged the write. An unacknowledged result carries no counts.
    pub acknowledged: bool,

    /// The number of documents affected by the write.
    pub count: u64,

    /// The `_id` of the document inserted by an upsert, if one was inserted.
    pub upserted_id: Option<Bson>,

    /// Whether an update modified an existing document rather than inserting a new one.
    pub update_of_existing: bool,
}

impl WriteConcernResult {
    pub(crate) fn acknowledged(
        count: u64,
        update_of_existing: bool,
        upserted_id: Option<Bson>,
    ) -> Self {
        Self {
            acknowledged: true,
            count,
            upserted_id,
            update_of_existing,
        }
    }

    /// The result of a write sent without requesting acknowledgement.
    pub fn unacknowledged() -> Self {
        Self {
            acknowledged: false,
            count: 0,
            upserted_id: None,
            update_of_existing: false,
        }
    }

    /// Whether the write updated an existing document.
    pub fn is_update_of_existing(&self) -> bool {
        self.update_of_existing
    }
}

/// Identifies a cursor that is open on a particular server.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ServerCursor {
    id: i64,
    address: ServerAddress,
}

impl ServerCursor {
    /// Creates a handle for the cursor `id` on the server at `address`.
    pub fn new(id: i64, address: ServerAddress) -> Self {
        Self { id, address }
    }

    /// The server-assigned cursor id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// The server that holds the cursor.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }
}

/// One decoded batch of a query or getMore, along with the cursor to continue from.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct QueryResult<T> {
    /// The namespace the batch was read from.
    pub namespace: Namespace,

    /// The decoded documents of this batch.
    pub results: Vec<T>,

    /// The cursor to request further batches from, or `None` once the cursor is exhausted.
    pub cursor: Option<ServerCursor>,

    /// The server that produced the batch.
    pub address: ServerAddress,
}

impl<T> QueryResult<T> {
    pub(crate) fn new(
        namespace: Namespace,
        results: Vec<T>,
        cursor_id: i64,
        address: ServerAddress,
    ) -> Self {
        let cursor = (cursor_id != 0).then(|| ServerCursor::new(cursor_id, address.clone()));
        Self {
            namespace,
            results,
            cursor,
            address,
        }
    }

    /// The id of the cursor to continue from, or 0 when it is exhausted.
    pub fn cursor_id(&self) -> i64 {
        self.cursor.as_ref().map(ServerCursor::id).unwrap_or(0)
    }

    /// Whether the server holds further results for this cursor.
    pub fn has_more(&self) -> bool {
        self.cursor.is_some()
    }
}
