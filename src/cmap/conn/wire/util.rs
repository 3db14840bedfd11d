use std::{
    io::Read,
    sync::atomic::{AtomicI32, Ordering},
};

use crate::error::{Error, Result};

static REQUEST_ID: AtomicI32 = AtomicI32::new(0);

/// Obtain a new, unique request ID.
pub(crate) fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Serializes `string` to bytes and appends them to `buffer` with a null terminator.
pub(crate) fn write_cstring(buffer: &mut Vec<u8>, string: &str) -> Result<()> {
    if string.contains('\0') {
        return Err(Error::invalid_argument(format!(
            "cstring with interior null: {:?}",
            string
        )));
    }
    buffer.extend_from_slice(string.as_bytes());
    buffer.push(0);
    Ok(())
}

/// Reads a null-terminated UTF-8 string.
pub(crate) fn read_cstring<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = reader.read_u8_sync()?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes).map_err(|e| Error::invalid_response(e.to_string()))
}

/// Little-endian primitive reads over a synchronous reader.
pub(crate) trait SyncLittleEndianRead: Read {
    fn read_i32_sync(&mut self) -> Result<i32> {
        let mut buf = [0; 4];
        self.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn read_u32_sync(&mut self) -> Result<u32> {
        let mut buf = [0; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i64_sync(&mut self) -> Result<i64> {
        let mut buf = [0; 8];
        self.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    fn read_u8_sync(&mut self) -> Result<u8> {
        let mut buf = [0; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }
}

impl<R: Read + ?Sized> SyncLittleEndianRead for R {}

pub(crate) struct SyncCountReader<R> {
    reader: R,
    bytes_read: usize,
}

impl<R: Read> SyncCountReader<R> {
    /// Constructs a new CountReader that wraps `reader`.
    pub(crate) fn new(reader: R) -> Self {
        SyncCountReader {
            reader,
            bytes_read: 0,
        }
    }

    /// Gets the number of bytes read so far.
    pub(crate) fn bytes_read(&self) -> usize {
        self.bytes_read
    }
}

impl<R: Read> Read for SyncCountReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes = self.reader.read(buf)?;
        self.bytes_read += bytes;
        Ok(bytes)
    }
}

/// Reads raw documents until `reader` is exhausted.
pub(crate) fn read_documents(mut reader: &[u8]) -> Result<Vec<crate::bson::RawDocumentBuf>> {
    let mut documents = Vec::new();
    while !reader.is_empty() {
        let bytes = crate::bson_util::read_document_bytes(&mut reader)?;
        documents.push(crate::bson::RawDocumentBuf::from_bytes(bytes)?);
    }
    Ok(documents)
}
