//! Decoders turning raw reply documents into caller types.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use crate::{
    bson::{self, Document, RawDocument},
    error::Result,
};

/// Decodes one raw document of a reply into a value.
///
/// Decoders are only ever handed documents from successful replies; documents describing a
/// server-side failure are classified and turned into errors before a decoder sees them.
pub trait Decoder: Send + Sync + 'static {
    /// The type produced by this decoder.
    type Output: Send + 'static;

    /// Decodes `document`.
    fn decode(&self, document: &RawDocument) -> Result<Self::Output>;
}

/// A decoder backed by `serde`.
#[derive(Debug)]
pub struct SerdeDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeDecoder<T> {
    /// Creates a decoder for `T`.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for SerdeDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for SerdeDecoder<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Decoder for SerdeDecoder<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Output = T;

    fn decode(&self, document: &RawDocument) -> Result<T> {
        Ok(bson::from_slice(document.as_bytes())?)
    }
}

/// Decodes into a generic [`Document`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DocumentDecoder;

impl Decoder for DocumentDecoder {
    type Output = Document;

    fn decode(&self, document: &RawDocument) -> Result<Document> {
        Ok(Document::try_from(document)?)
    }
}

impl<D: Decoder> Decoder for std::sync::Arc<D> {
    type Output = D::Output;

    fn decode(&self, document: &RawDocument) -> Result<Self::Output> {
        D::decode(self, document)
    }
}
