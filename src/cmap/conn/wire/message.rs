use std::io::Read;

use bitflags::bitflags;

use super::{
    header::{Header, OpCode},
    util::{read_cstring, SyncCountReader, SyncLittleEndianRead},
};
use crate::{
    bson::{Array, Bson, Document, RawDocumentBuf},
    bson_util,
    error::{Error, Result},
};

/// Represents an OP_MSG wire protocol operation.
#[derive(Clone, Debug)]
pub(crate) struct Message {
    // OP_MSG payload type 0
    pub(crate) document_payload: RawDocumentBuf,
    // OP_MSG payload type 1
    pub(crate) document_sequences: Vec<DocumentSequence>,
    pub(crate) flags: MessageFlags,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<RawDocumentBuf>,
}

impl Message {
    pub(crate) fn new(document_payload: RawDocumentBuf, flags: MessageFlags) -> Self {
        Self {
            document_payload,
            document_sequences: Vec::new(),
            flags,
        }
    }

    /// Gets this message's command as a Document, with document sequences folded back into the
    /// command as arrays. If deserialization fails, returns a document containing the error.
    pub(crate) fn get_command_document(&self) -> Document {
        let mut command = match self.document_payload.to_document() {
            Ok(document) => document,
            Err(error) => return crate::bson::doc! { "serialization error": error.to_string() },
        };

        for document_sequence in &self.document_sequences {
            let mut documents = Array::new();
            for document in &document_sequence.documents {
                match document.to_document() {
                    Ok(document) => documents.push(Bson::Document(document)),
                    Err(error) => {
                        return crate::bson::doc! { "serialization error": error.to_string() }
                    }
                }
            }
            command.insert(document_sequence.identifier.clone(), documents);
        }

        command
    }

    /// Parses the bytes following an OP_MSG header.
    pub(crate) fn read_body(header: &Header, mut reader: &[u8]) -> Result<Self> {
        let mut length_remaining = reader.len();
        let flags = MessageFlags::from_bits_truncate(reader.read_u32_sync()?);
        length_remaining -= std::mem::size_of::<u32>();

        let checksum_length = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            std::mem::size_of::<u32>()
        } else {
            0
        };
        let sections_length = length_remaining
            .checked_sub(checksum_length)
            .ok_or_else(|| Error::invalid_response("OP_MSG too short for its checksum"))?;

        let mut count_reader = SyncCountReader::new(&mut reader);
        let mut document_payload = None;
        let mut document_sequences = Vec::new();
        while count_reader.bytes_read() < sections_length {
            match MessageSection::read(&mut count_reader)? {
                MessageSection::Document(document) => {
                    if document_payload.is_some() {
                        return Err(Error::invalid_response(
                            "an OP_MSG response must contain exactly one payload type 0 section",
                        ));
                    }
                    document_payload = Some(document);
                }
                MessageSection::Sequence(document_sequence) => {
                    document_sequences.push(document_sequence)
                }
            }
        }

        if count_reader.bytes_read() != sections_length {
            return Err(Error::invalid_response(format!(
                "The server indicated that the reply would be {} bytes long, but it instead was {}",
                header.length,
                Header::LENGTH + std::mem::size_of::<u32>() + count_reader.bytes_read()
                    + checksum_length,
            )));
        }

        Ok(Self {
            flags,
            document_payload: document_payload.ok_or_else(|| {
                Error::invalid_response(
                    "an OP_MSG response must contain exactly one payload type 0 section",
                )
            })?,
            document_sequences,
        })
    }

    /// Serializes the message body (everything after the header).
    pub(crate) fn write_body(&self, buffer: &mut Vec<u8>) -> Result<()> {
        buffer.extend_from_slice(&self.flags.bits().to_le_bytes());

        // Payload type 0
        buffer.push(0);
        buffer.extend_from_slice(self.document_payload.as_bytes());

        for document_sequence in &self.document_sequences {
            // Payload type 1
            buffer.push(1);

            let identifier_bytes = document_sequence.identifier.as_bytes();

            let documents_size = document_sequence
                .documents
                .iter()
                .fold(0, |running_size, document| {
                    running_size + document.as_bytes().len()
                });

            // Size bytes + identifier bytes + null-terminator byte + document bytes
            let size = i32::try_from(4 + identifier_bytes.len() + 1 + documents_size)
                .map_err(|_| Error::invalid_argument("document sequence too large"))?;
            buffer.extend_from_slice(&size.to_le_bytes());

            buffer.extend_from_slice(identifier_bytes);
            buffer.push(0);

            for document in &document_sequence.documents {
                buffer.extend_from_slice(document.as_bytes());
            }
        }

        Ok(())
    }

    pub(crate) const OP_CODE: OpCode = OpCode::Message;
}

bitflags! {
    /// Represents the bitwise flags for an OP_MSG.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// One section of an OP_MSG body.
#[derive(Debug)]
enum MessageSection {
    Document(RawDocumentBuf),
    Sequence(DocumentSequence),
}

impl MessageSection {
    /// Reads bytes from `reader` and deserializes them into a MessageSection.
    fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let payload_type = reader.read_u8_sync()?;

        if payload_type == 0 {
            let bytes = bson_util::read_document_bytes(reader)?;
            let document = RawDocumentBuf::from_bytes(bytes)?;
            return Ok(MessageSection::Document(document));
        }

        let size = reader.read_i32_sync()?;
        let mut length_remaining = usize::try_from(size)
            .ok()
            .and_then(|size| size.checked_sub(std::mem::size_of::<i32>()))
            .ok_or_else(|| Error::invalid_response(format!("invalid section size: {}", size)))?;

        let identifier = read_cstring(reader)?;
        length_remaining = length_remaining
            .checked_sub(identifier.len() + 1)
            .ok_or_else(|| Error::invalid_response("document sequence identifier too long"))?;

        let mut documents = Vec::new();
        let mut count_reader = SyncCountReader::new(reader);

        while length_remaining > count_reader.bytes_read() {
            let bytes = bson_util::read_document_bytes(&mut count_reader)?;
            let document = RawDocumentBuf::from_bytes(bytes)?;
            documents.push(document);
        }

        if length_remaining != count_reader.bytes_read() {
            return Err(Error::invalid_response(format!(
                "The server indicated that the reply would be {} bytes long, but it instead was \
                 {}",
                size,
                size as usize - length_remaining + count_reader.bytes_read(),
            )));
        }

        Ok(MessageSection::Sequence(DocumentSequence {
            identifier,
            documents,
        }))
    }
}
