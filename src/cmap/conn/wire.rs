mod header;
mod legacy;
mod message;
mod reply;
#[cfg(test)]
mod test;
mod util;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub(crate) use self::{
    header::{read_message, Header, OpCode},
    legacy::{Delete, GetMore, Insert, KillCursors, Query, QueryFlags, Update, UpdateFlags},
    message::{DocumentSequence, Message, MessageFlags},
    reply::{Reply, ResponseFlags},
    util::next_request_id,
};
use crate::error::{Error, Result};

/// A message the driver sends to a server.
#[derive(Clone, Debug)]
pub(crate) enum Request {
    Message(Message),
    Query(Query),
    GetMore(GetMore),
    KillCursors(KillCursors),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

impl Request {
    pub(crate) fn op_code(&self) -> OpCode {
        match self {
            Self::Message(_) => OpCode::Message,
            Self::Query(_) => OpCode::Query,
            Self::GetMore(_) => OpCode::GetMore,
            Self::KillCursors(_) => OpCode::KillCursors,
            Self::Insert(_) => OpCode::Insert,
            Self::Update(_) => OpCode::Update,
            Self::Delete(_) => OpCode::Delete,
        }
    }

    /// A short name for the request, used in log events.
    pub(crate) fn op_name(&self) -> &'static str {
        match self {
            Self::Message(_) => "OP_MSG",
            Self::Query(_) => "OP_QUERY",
            Self::GetMore(_) => "OP_GET_MORE",
            Self::KillCursors(_) => "OP_KILL_CURSORS",
            Self::Insert(_) => "OP_INSERT",
            Self::Update(_) => "OP_UPDATE",
            Self::Delete(_) => "OP_DELETE",
        }
    }

    /// Whether the server answers this request on the same connection.
    pub(crate) fn expects_response(&self) -> bool {
        match self {
            Self::Message(message) => !message.flags.contains(MessageFlags::MORE_TO_COME),
            Self::Query(_) | Self::GetMore(_) => true,
            Self::KillCursors(_) | Self::Insert(_) | Self::Update(_) | Self::Delete(_) => false,
        }
    }

    /// Serializes the request, header included.
    pub(crate) fn encode(&self, request_id: i32) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        match self {
            Self::Message(message) => message.write_body(&mut body)?,
            Self::Query(query) => query.write_body(&mut body)?,
            Self::GetMore(get_more) => get_more.write_body(&mut body)?,
            Self::KillCursors(kill_cursors) => kill_cursors.write_body(&mut body)?,
            Self::Insert(insert) => insert.write_body(&mut body)?,
            Self::Update(update) => update.write_body(&mut body)?,
            Self::Delete(delete) => delete.write_body(&mut body)?,
        }
        frame(self.op_code(), request_id, 0, body)
    }

    /// Reads one request off `reader`, the way a server would.
    #[cfg(test)]
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        max_message_size_bytes: i32,
    ) -> Result<(Header, Self)> {
        let (header, body) = read_message(reader, max_message_size_bytes).await?;
        let request = match header.op_code {
            OpCode::Message => Self::Message(Message::read_body(&header, &body)?),
            OpCode::Query => Self::Query(Query::read_body(&body)?),
            OpCode::GetMore => Self::GetMore(GetMore::read_body(&body)?),
            OpCode::KillCursors => Self::KillCursors(KillCursors::read_body(&body)?),
            OpCode::Insert => Self::Insert(Insert::read_body(&body)?),
            OpCode::Update => Self::Update(Update::read_body(&body)?),
            OpCode::Delete => Self::Delete(Delete::read_body(&body)?),
            OpCode::Reply => {
                return Err(Error::invalid_response("OP_REPLY is not a request"));
            }
        };
        Ok((header, request))
    }
}

/// A message a server sends back in answer to a request.
#[derive(Clone, Debug)]
pub(crate) enum Response {
    Reply(Reply),
    Message(Message),
}

impl Response {
    /// Reads one response off `reader`, returning the request id it answers along with it.
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        max_message_size_bytes: i32,
    ) -> Result<(i32, Self)> {
        let (header, body) = read_message(reader, max_message_size_bytes).await?;
        let response = match header.op_code {
            OpCode::Reply => Self::Reply(Reply::read_body(&body)?),
            OpCode::Message => Self::Message(Message::read_body(&header, &body)?),
            other => {
                return Err(Error::invalid_response(format!(
                    "Invalid response op code, expected OP_REPLY ({}) or OP_MSG ({}) but got {:?}",
                    OpCode::Reply as i32,
                    OpCode::Message as i32,
                    other
                )));
            }
        };
        Ok((header.response_to, response))
    }

    /// Serializes the response as an answer to `response_to`.
    #[cfg(test)]
    pub(crate) fn encode(&self, request_id: i32, response_to: i32) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        let op_code = match self {
            Self::Reply(reply) => {
                reply.write_body(&mut body);
                Reply::OP_CODE
            }
            Self::Message(message) => {
                message.write_body(&mut body)?;
                Message::OP_CODE
            }
        };
        frame(op_code, request_id, response_to, body)
    }
}

fn frame(op_code: OpCode, request_id: i32, response_to: i32, body: Vec<u8>) -> Result<Vec<u8>> {
    let length = i32::try_from(Header::LENGTH + body.len()).map_err(|_| {
        Error::invalid_argument(format!("message body of {} bytes is too large", body.len()))
    })?;
    let header = Header {
        length,
        request_id,
        response_to,
        op_code,
    };
    let mut bytes = Vec::with_capacity(Header::LENGTH + body.len());
    header.write_to(&mut bytes);
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Writes already-framed bytes and flushes them.
pub(crate) async fn write_framed<W: AsyncWrite + Unpin + Send>(
    writer: &mut W,
    bytes: &[u8],
) -> Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}
