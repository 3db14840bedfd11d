//! Field name rules applied to outgoing documents before they are encoded.

use crate::{
    bson::{Bson, Document},
    error::{Error, Result},
};

/// Validates the keys of an outgoing document.
///
/// Validation runs before anything is written to the connection, so a rejected key never
/// reaches the server.
pub trait FieldNameValidator: Send + Sync + 'static {
    /// Returns whether `field_name` is acceptable at this level of the document.
    fn validate(&self, field_name: &str) -> bool;

    /// The validator that applies to the value of `field_name`.
    fn validator_for_field(&self, _field_name: &str) -> &dyn FieldNameValidator {
        &NoOpFieldNameValidator
    }
}

/// Accepts every field name.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpFieldNameValidator;

impl FieldNameValidator for NoOpFieldNameValidator {
    fn validate(&self, _field_name: &str) -> bool {
        true
    }
}

/// Rejects field names that the server cannot store: names starting with `$` or containing `.`.
/// Applies at every nesting level.
#[derive(Clone, Copy, Debug, Default)]
pub struct CollectibleDocumentFieldNameValidator;

impl FieldNameValidator for CollectibleDocumentFieldNameValidator {
    fn validate(&self, field_name: &str) -> bool {
        !field_name.starts_with('$') && !field_name.contains('.')
    }

    fn validator_for_field(&self, _field_name: &str) -> &dyn FieldNameValidator {
        self
    }
}

/// Requires every top-level key of an update to be an update operator.
#[derive(Clone, Copy, Debug, Default)]
pub struct UpdateFieldNameValidator;

impl FieldNameValidator for UpdateFieldNameValidator {
    fn validate(&self, field_name: &str) -> bool {
        field_name.starts_with('$')
    }
}

/// Rejects update operators in a replacement document. Nested documents may use dotted or
/// `$`-prefixed names.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReplacingDocumentFieldNameValidator;

impl FieldNameValidator for ReplacingDocumentFieldNameValidator {
    fn validate(&self, field_name: &str) -> bool {
        !field_name.starts_with('$')
    }
}

/// Checks every key of `document` against `validator`, descending into embedded documents and
/// arrays with the validator each field nominates.
pub fn validate_document(document: &Document, validator: &dyn FieldNameValidator) -> Result<()> {
    for (key, value) in document {
        if !validator.validate(key) {
            return Err(Error::invalid_argument(format!(
                "invalid BSON field name '{}'",
                key
            )));
        }
        validate_value(value, validator.validator_for_field(key))?;
    }
    Ok(())
}

fn validate_value(value: &Bson, validator: &dyn FieldNameValidator) -> Result<()> {
    match value {
        Bson::Document(document) => validate_document(document, validator),
        Bson::Array(values) => values
            .iter()
            .try_for_each(|value| validate_value(value, validator)),
        _ => Ok(()),
    }
}
