//! Connections and the wire protocol spoken over them.

pub(crate) mod conn;

pub(crate) use self::conn::{Command, CommandResponse};
pub use self::conn::{
    AsyncStream,
    Connection,
    ConnectionDescription,
    ConnectionId,
    PayloadKind,
    PinningMode,
    SplittablePayload,
    DEFAULT_MAX_DOCUMENT_SIZE,
    DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_MAX_WRITE_BATCH_SIZE,
    LATEST_WIRE_VERSION,
};
