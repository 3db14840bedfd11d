use bitflags::bitflags;

use super::{
    header::{Header, OpCode},
    util::{read_documents, SyncLittleEndianRead},
};
use crate::{
    bson::RawDocumentBuf,
    error::{Error, Result},
};

/// Represents a wire protocol OP_REPLY operation.
#[derive(Clone, Debug)]
pub(crate) struct Reply {
    pub(crate) flags: ResponseFlags,
    pub(crate) cursor_id: i64,
    pub(crate) starting_from: i32,
    pub(crate) number_returned: i32,
    pub(crate) documents: Vec<RawDocumentBuf>,
}

bitflags! {
    /// Represents the bitwise flags for an OP_REPLY.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct ResponseFlags: u32 {
        const CURSOR_NOT_FOUND = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const QUERY_FAILURE    = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const AWAIT_CAPABLE    = 0b_0000_0000_0000_0000_0000_0000_0000_1000;
    }
}

impl Reply {
    pub(crate) const OP_CODE: OpCode = OpCode::Reply;

    /// Parses the bytes following an OP_REPLY header.
    pub(crate) fn read_body(mut reader: &[u8]) -> Result<Self> {
        let flags = ResponseFlags::from_bits_truncate(reader.read_u32_sync()?);
        let cursor_id = reader.read_i64_sync()?;
        let starting_from = reader.read_i32_sync()?;
        let number_returned = reader.read_i32_sync()?;
        let documents = read_documents(reader)?;

        if usize::try_from(number_returned).ok() != Some(documents.len()) {
            return Err(Error::invalid_response(format!(
                "The server indicated that the reply would contain {} documents, but it instead \
                 contained {}",
                number_returned,
                documents.len()
            )));
        }

        Ok(Self {
            flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        })
    }

    pub(crate) fn write_body(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.flags.bits().to_le_bytes());
        buffer.extend_from_slice(&self.cursor_id.to_le_bytes());
        buffer.extend_from_slice(&self.starting_from.to_le_bytes());
        buffer.extend_from_slice(&self.number_returned.to_le_bytes());
        for document in &self.documents {
            buffer.extend_from_slice(document.as_bytes());
        }
    }
}
