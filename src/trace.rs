use crate::{
    bson::{Bson, Document},
    options::ServerAddress,
    selection_criteria::SelectionCriteria,
};

pub(crate) const COMMAND_TRACING_EVENT_TARGET: &str = "mongodb_binding::command";
pub(crate) const CONNECTION_TRACING_EVENT_TARGET: &str = "mongodb_binding::connection";
pub(crate) const SERVER_SELECTION_TRACING_EVENT_TARGET: &str = "mongodb_binding::server_selection";
pub(crate) const BINDING_TRACING_EVENT_TARGET: &str = "mongodb_binding::binding";

/// Commands and replies larger than this are truncated in trace events.
pub(crate) const DEFAULT_MAX_DOCUMENT_LENGTH_BYTES: usize = 1000;

pub(crate) trait TracingRepresentation {
    type Representation;

    fn tracing_representation(&self) -> Self::Representation;
}

impl TracingRepresentation for Document {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        let mut json = Bson::Document(self.clone())
            .into_relaxed_extjson()
            .to_string();
        truncate_on_char_boundary(&mut json, DEFAULT_MAX_DOCUMENT_LENGTH_BYTES);
        json
    }
}

impl TracingRepresentation for crate::error::Error {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_string()
    }
}

impl TracingRepresentation for SelectionCriteria {
    type Representation = String;

    fn tracing_representation(&self) -> Self::Representation {
        self.to_string()
    }
}

impl ServerAddress {
    pub(crate) fn port_tracing_representation(&self) -> u16 {
        self.port()
    }
}

/// Truncates `s` to at most `new_length` bytes, backing off to the nearest character boundary and
/// appending "..." when anything was cut.
pub(crate) fn truncate_on_char_boundary(s: &mut String, new_length: usize) {
    let original_length = s.len();
    if original_length <= new_length {
        return;
    }
    let mut truncate_index = new_length;
    while !s.is_char_boundary(truncate_index) {
        truncate_index -= 1;
    }
    s.truncate(truncate_index);
    s.push_str("...");
}

#[cfg(test)]
mod test {
    use super::truncate_on_char_boundary;

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut s = String::from("héllo");
        truncate_on_char_boundary(&mut s, 2);
        assert_eq!(s, "h...");

        let mut s = String::from("short");
        truncate_on_char_boundary(&mut s, 10);
        assert_eq!(s, "short");
    }
}
