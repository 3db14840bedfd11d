use std::{io::Read, time::Duration};

use serde::{Deserialize, Deserializer, Serializer};

use crate::{
    bson::{Bson, Document, RawBsonRef, RawDocumentBuf},
    error::{Error, Result},
};

/// The smallest possible BSON document: a length prefix and a null terminator.
pub(crate) const MIN_DOCUMENT_LENGTH: i32 = 5;

/// Coerce numeric types into an `i64` if it would be lossless to do so. If this Bson is not numeric
/// or the conversion would be lossy (e.g. 1.5 -> 1), this returns `None`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}

/// Coerce numeric types into an `i64` if it would be lossless to do so.
pub(crate) fn get_int_raw(val: RawBsonRef<'_>) -> Option<i64> {
    match val {
        RawBsonRef::Int32(i) => get_int(&Bson::Int32(i)),
        RawBsonRef::Int64(i) => get_int(&Bson::Int64(i)),
        RawBsonRef::Double(i) => get_int(&Bson::Double(i)),
        _ => None,
    }
}

pub(crate) fn to_bson_array(docs: &[Document]) -> Bson {
    Bson::Array(docs.iter().map(|doc| Bson::Document(doc.clone())).collect())
}

pub(crate) fn first_key(document: &Document) -> Option<&str> {
    document.keys().next().map(String::as_str)
}

/// Serializes `document` into raw BSON.
pub(crate) fn to_raw_document_buf(document: &Document) -> Result<RawDocumentBuf> {
    Ok(RawDocumentBuf::from_document(document)?)
}

/// The size in bytes of the provided document's entry in a BSON array at the given index.
pub(crate) fn array_entry_size_bytes(index: usize, doc_len: usize) -> usize {
    //   * type (1 byte)
    //   * number of decimal digits in key
    //   * null terminator for the key (1 byte)
    //   * size of value
    1 + num_decimal_digits(index) + 1 + doc_len
}

/// The number of digits in `n` in base 10.
fn num_decimal_digits(mut n: usize) -> usize {
    let mut digits = 0;

    loop {
        n /= 10;
        digits += 1;

        if n == 0 {
            return digits;
        }
    }
}

/// Read a document's raw BSON bytes from the provided reader.
pub(crate) fn read_document_bytes<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    let mut length_bytes = [0u8; 4];
    reader.read_exact(&mut length_bytes)?;
    let length = i32::from_le_bytes(length_bytes);
    if length < MIN_DOCUMENT_LENGTH {
        return Err(Error::invalid_response(format!(
            "invalid BSON document length: {}",
            length
        )));
    }

    let mut bytes = Vec::with_capacity(length as usize);
    bytes.extend_from_slice(&length_bytes);
    reader.take(length as u64 - 4).read_to_end(&mut bytes)?;
    if bytes.len() != length as usize {
        return Err(Error::invalid_response(format!(
            "BSON document declared {} bytes but only {} were available",
            length,
            bytes.len()
        )));
    }

    Ok(bytes)
}

pub(crate) fn serialize_duration_option_as_int_millis<S: Serializer>(
    val: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(duration) => serializer.serialize_i64(duration.as_millis() as i64),
        None => serializer.serialize_none(),
    }
}

pub(crate) fn deserialize_duration_option_from_u64_millis<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = Option::<u64>::deserialize(deserializer)?;
    Ok(millis.map(Duration::from_millis))
}

#[cfg(test)]
mod test {
    use crate::{
        bson::{doc, Bson},
        bson_util::{array_entry_size_bytes, get_int, num_decimal_digits, read_document_bytes},
    };

    #[test]
    fn num_digits() {
        assert_eq!(num_decimal_digits(0), 1);
        assert_eq!(num_decimal_digits(1), 1);
        assert_eq!(num_decimal_digits(10), 2);
        assert_eq!(num_decimal_digits(15), 2);
        assert_eq!(num_decimal_digits(100), 3);
        assert_eq!(num_decimal_digits(125), 3);
    }

    #[test]
    fn array_entry_size() {
        let document = doc! { "a": 1 };
        let array = doc! { "0": document.clone() };
        let mut array_bytes = Vec::new();
        array.to_writer(&mut array_bytes).unwrap();
        let mut document_bytes = Vec::new();
        document.to_writer(&mut document_bytes).unwrap();

        // An array is a document: 4 length bytes + entries + a trailing null.
        assert_eq!(
            array_bytes.len(),
            4 + array_entry_size_bytes(0, document_bytes.len()) + 1
        );
    }

    #[test]
    fn int_coercion() {
        assert_eq!(get_int(&Bson::Int32(5)), Some(5));
        assert_eq!(get_int(&Bson::Double(3.0)), Some(3));
        assert_eq!(get_int(&Bson::Double(1.5)), None);
        assert_eq!(get_int(&Bson::String("1".into())), None);
    }

    #[test]
    fn read_document_bytes_checks_lengths() {
        let mut bytes = Vec::new();
        doc! { "x": 1 }.to_writer(&mut bytes).unwrap();
        assert_eq!(read_document_bytes(bytes.as_slice()).unwrap(), bytes);

        assert!(read_document_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(read_document_bytes([1u8, 0, 0, 0].as_slice()).is_err());
    }
}
