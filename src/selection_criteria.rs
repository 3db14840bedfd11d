//! Contains the types describing which servers an operation may be routed to.

use std::{collections::HashMap, sync::Arc};

use derive_where::derive_where;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    bson::{self, Document},
    error::{Error, Result},
    sdam::ServerDescription,
};

/// Which servers an operation may be sent to.
#[derive(Clone, derive_more::Display)]
#[derive_where(Debug)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// Routing by server type and tags.
    #[display("ReadPreference {_0}")]
    ReadPreference(ReadPreference),

    /// Routing to whichever servers the predicate accepts.
    #[display("Custom predicate")]
    Predicate(#[derive_where(skip)] Predicate),
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    /// Criteria for a write: only a server able to accept writes is suitable.
    pub(crate) fn for_writes() -> Self {
        Self::ReadPreference(ReadPreference::Primary)
    }
}

/// Accepts or rejects a server during selection.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerDescription) -> bool>;

/// The replica set members a read may be routed to. Every mode except `Primary` may carry tag
/// sets narrowing the eligible secondaries.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// The primary only.
    Primary,

    /// Secondaries only.
    Secondary {
        options: Option<ReadPreferenceOptions>,
    },

    /// The primary, or a secondary while there is no primary.
    PrimaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// A secondary, or the primary while no secondary is suitable.
    SecondaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// Any member within the latency window.
    Nearest {
        options: Option<ReadPreferenceOptions>,
    },
}

impl std::fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut mode = self.mode().to_string();
        mode[0..1].make_ascii_uppercase();
        write!(f, "{{ Mode: {}", mode)?;

        if let Some(tag_sets) = self.tag_sets() {
            write!(f, ", Tag Sets: {:?}", tag_sets)?;
        }

        write!(f, " }}")
    }
}

impl Serialize for ReadPreference {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[serde_with::skip_serializing_none]
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct ReadPreferenceHelper<'a> {
            mode: &'static str,
            #[serde(flatten)]
            options: Option<&'a ReadPreferenceOptions>,
        }

        let helper = ReadPreferenceHelper {
            mode: self.mode(),
            options: self.options(),
        };
        helper.serialize(serializer)
    }
}

/// Options of a non-primary read preference.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Tried in order; the first tag set matched by at least one server wins.
    pub tag_sets: Option<Vec<TagSet>>,
}

impl ReadPreference {
    /// The wire name of this read preference's mode.
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary { .. } => "secondary",
            Self::PrimaryPreferred { .. } => "primaryPreferred",
            Self::SecondaryPreferred { .. } => "secondaryPreferred",
            Self::Nearest { .. } => "nearest",
        }
    }

    pub(crate) fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            Self::Primary => None,
            Self::Secondary { options }
            | Self::PrimaryPreferred { options }
            | Self::SecondaryPreferred { options }
            | Self::Nearest { options } => options.as_ref(),
        }
    }

    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        self.options().and_then(|options| options.tag_sets.as_ref())
    }

    /// Whether an operation with this read preference may run on a secondary, which on legacy
    /// framing requires the `secondaryOk` bit.
    pub(crate) fn is_secondary_ok(&self) -> bool {
        !matches!(self, Self::Primary)
    }

    /// Attaches tag sets to a non-primary read preference.
    pub fn with_tags(mut self, tag_sets: Vec<TagSet>) -> Result<Self> {
        let options = match self {
            Self::Primary => {
                return Err(Error::invalid_argument(
                    "read preference tags can only be specified when a non-primary mode is \
                     specified",
                ));
            }
            Self::Secondary { ref mut options } => options,
            Self::PrimaryPreferred { ref mut options } => options,
            Self::SecondaryPreferred { ref mut options } => options,
            Self::Nearest { ref mut options } => options,
        };

        options.get_or_insert_with(Default::default).tag_sets = Some(tag_sets);

        Ok(self)
    }

    /// The `$readPreference` document sent to the server.
    pub(crate) fn to_document(&self) -> Result<Document> {
        Ok(bson::to_document(self)?)
    }
}

/// A read preference tag set.
pub type TagSet = HashMap<String, String>;
