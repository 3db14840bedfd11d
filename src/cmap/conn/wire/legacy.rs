//! The pre-OP_MSG request opcodes, spoken to servers whose wire version predates the command
//! equivalents.

use bitflags::bitflags;

use super::util::write_cstring;
#[cfg(test)]
use super::util::{read_cstring, read_documents, SyncLittleEndianRead};
#[cfg(test)]
use crate::bson_util;
use crate::{
    bson::RawDocumentBuf,
    error::{Error, Result},
    Namespace,
};

bitflags! {
    /// Represents the bitwise flags for an OP_QUERY.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub(crate) struct QueryFlags: u32 {
        const TAILABLE_CURSOR   = 0b_0000_0010;
        const SECONDARY_OK      = 0b_0000_0100;
        const OPLOG_REPLAY      = 0b_0000_1000;
        const NO_CURSOR_TIMEOUT = 0b_0001_0000;
        const AWAIT_DATA        = 0b_0010_0000;
        const EXHAUST           = 0b_0100_0000;
        const PARTIAL           = 0b_1000_0000;
    }
}

bitflags! {
    /// Represents the bitwise flags for an OP_UPDATE.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub(crate) struct UpdateFlags: u32 {
        const UPSERT       = 0b_0000_0001;
        const MULTI_UPDATE = 0b_0000_0010;
    }
}

const CONTINUE_ON_ERROR: u32 = 0b_0000_0001;
const SINGLE_REMOVE: u32 = 0b_0000_0001;

/// OP_QUERY
#[derive(Clone, Debug)]
pub(crate) struct Query {
    pub(crate) flags: QueryFlags,
    pub(crate) namespace: Namespace,
    pub(crate) number_to_skip: i32,
    pub(crate) number_to_return: i32,
    pub(crate) query: RawDocumentBuf,
    pub(crate) return_fields_selector: Option<RawDocumentBuf>,
}

impl Query {
    pub(crate) fn write_body(&self, buffer: &mut Vec<u8>) -> Result<()> {
        buffer.extend_from_slice(&self.flags.bits().to_le_bytes());
        write_cstring(buffer, &self.namespace.to_string())?;
        buffer.extend_from_slice(&self.number_to_skip.to_le_bytes());
        buffer.extend_from_slice(&self.number_to_return.to_le_bytes());
        buffer.extend_from_slice(self.query.as_bytes());
        if let Some(ref fields) = self.return_fields_selector {
            buffer.extend_from_slice(fields.as_bytes());
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn read_body(mut reader: &[u8]) -> Result<Self> {
        let flags = QueryFlags::from_bits_truncate(reader.read_u32_sync()?);
        let namespace = read_namespace(&mut reader)?;
        let number_to_skip = reader.read_i32_sync()?;
        let number_to_return = reader.read_i32_sync()?;
        let query = RawDocumentBuf::from_bytes(bson_util::read_document_bytes(&mut reader)?)?;
        let return_fields_selector = read_documents(reader)?.into_iter().next();
        Ok(Self {
            flags,
            namespace,
            number_to_skip,
            number_to_return,
            query,
            return_fields_selector,
        })
    }
}

/// OP_GET_MORE
#[derive(Clone, Debug)]
pub(crate) struct GetMore {
    pub(crate) namespace: Namespace,
    pub(crate) number_to_return: i32,
    pub(crate) cursor_id: i64,
}

impl GetMore {
    pub(crate) fn write_body(&self, buffer: &mut Vec<u8>) -> Result<()> {
        buffer.extend_from_slice(&0i32.to_le_bytes());
        write_cstring(buffer, &self.namespace.to_string())?;
        buffer.extend_from_slice(&self.number_to_return.to_le_bytes());
        buffer.extend_from_slice(&self.cursor_id.to_le_bytes());
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn read_body(mut reader: &[u8]) -> Result<Self> {
        let _zero = reader.read_i32_sync()?;
        let namespace = read_namespace(&mut reader)?;
        let number_to_return = reader.read_i32_sync()?;
        let cursor_id = reader.read_i64_sync()?;
        Ok(Self {
            namespace,
            number_to_return,
            cursor_id,
        })
    }
}

/// OP_KILL_CURSORS
#[derive(Clone, Debug)]
pub(crate) struct KillCursors {
    pub(crate) cursor_ids: Vec<i64>,
}

impl KillCursors {
    pub(crate) fn write_body(&self, buffer: &mut Vec<u8>) -> Result<()> {
        let count = i32::try_from(self.cursor_ids.len())
            .map_err(|_| Error::invalid_argument("too many cursors to kill in one message"))?;
        buffer.extend_from_slice(&0i32.to_le_bytes());
        buffer.extend_from_slice(&count.to_le_bytes());
        for id in &self.cursor_ids {
            buffer.extend_from_slice(&id.to_le_bytes());
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn read_body(mut reader: &[u8]) -> Result<Self> {
        let _zero = reader.read_i32_sync()?;
        let count = reader.read_i32_sync()?;
        let cursor_ids = (0..count)
            .map(|_| reader.read_i64_sync())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { cursor_ids })
    }
}

/// OP_INSERT
#[derive(Clone, Debug)]
pub(crate) struct Insert {
    pub(crate) continue_on_error: bool,
    pub(crate) namespace: Namespace,
    pub(crate) documents: Vec<RawDocumentBuf>,
}

impl Insert {
    pub(crate) fn write_body(&self, buffer: &mut Vec<u8>) -> Result<()> {
        let flags = if self.continue_on_error {
            CONTINUE_ON_ERROR
        } else {
            0
        };
        buffer.extend_from_slice(&flags.to_le_bytes());
        write_cstring(buffer, &self.namespace.to_string())?;
        for document in &self.documents {
            buffer.extend_from_slice(document.as_bytes());
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn read_body(mut reader: &[u8]) -> Result<Self> {
        let flags = reader.read_u32_sync()?;
        let namespace = read_namespace(&mut reader)?;
        let documents = read_documents(reader)?;
        Ok(Self {
            continue_on_error: flags & CONTINUE_ON_ERROR != 0,
            namespace,
            documents,
        })
    }
}

/// OP_UPDATE
#[derive(Clone, Debug)]
pub(crate) struct Update {
    pub(crate) namespace: Namespace,
    pub(crate) flags: UpdateFlags,
    pub(crate) selector: RawDocumentBuf,
    pub(crate) update: RawDocumentBuf,
}

impl Update {
    pub(crate) fn write_body(&self, buffer: &mut Vec<u8>) -> Result<()> {
        buffer.extend_from_slice(&0i32.to_le_bytes());
        write_cstring(buffer, &self.namespace.to_string())?;
        buffer.extend_from_slice(&self.flags.bits().to_le_bytes());
        buffer.extend_from_slice(self.selector.as_bytes());
        buffer.extend_from_slice(self.update.as_bytes());
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn read_body(mut reader: &[u8]) -> Result<Self> {
        let _zero = reader.read_i32_sync()?;
        let namespace = read_namespace(&mut reader)?;
        let flags = UpdateFlags::from_bits_truncate(reader.read_u32_sync()?);
        let mut documents = read_documents(reader)?.into_iter();
        match (documents.next(), documents.next()) {
            (Some(selector), Some(update)) => Ok(Self {
                namespace,
                flags,
                selector,
                update,
            }),
            _ => Err(Error::invalid_response(
                "OP_UPDATE must carry a selector and an update",
            )),
        }
    }
}

/// OP_DELETE
#[derive(Clone, Debug)]
pub(crate) struct Delete {
    pub(crate) namespace: Namespace,
    pub(crate) single_remove: bool,
    pub(crate) selector: RawDocumentBuf,
}

impl Delete {
    pub(crate) fn write_body(&self, buffer: &mut Vec<u8>) -> Result<()> {
        let flags = if self.single_remove { SINGLE_REMOVE } else { 0 };
        buffer.extend_from_slice(&0i32.to_le_bytes());
        write_cstring(buffer, &self.namespace.to_string())?;
        buffer.extend_from_slice(&flags.to_le_bytes());
        buffer.extend_from_slice(self.selector.as_bytes());
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn read_body(mut reader: &[u8]) -> Result<Self> {
        let _zero = reader.read_i32_sync()?;
        let namespace = read_namespace(&mut reader)?;
        let flags = reader.read_u32_sync()?;
        let selector = RawDocumentBuf::from_bytes(bson_util::read_document_bytes(&mut reader)?)?;
        Ok(Self {
            namespace,
            single_remove: flags & SINGLE_REMOVE != 0,
            selector,
        })
    }
}

#[cfg(test)]
fn read_namespace(reader: &mut &[u8]) -> Result<Namespace> {
    read_cstring(reader)?
        .parse()
        .map_err(|_| Error::invalid_response("malformed full collection name"))
}
