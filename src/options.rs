//! Contains the configuration types used by the binding layer.

use std::{
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    str::FromStr,
    time::Duration,
};

use serde::{
    de::{Error as SerdeDeError, Unexpected},
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    bson::Document,
    error::{Error, Result},
};

pub use crate::{
    concern::{Acknowledgment, WriteConcern},
    selection_criteria::{ReadPreference, ReadPreferenceOptions, SelectionCriteria, TagSet},
};

/// The default port MongoDB servers listen on.
pub const DEFAULT_PORT: u16 = 27017;

/// A hostname:port address pair.
#[derive(Clone, Debug, Eq)]
#[non_exhaustive]
pub struct ServerAddress {
    /// The hostname of the address.
    pub host: String,

    /// The port of the address.
    ///
    /// The default is 27017.
    pub port: Option<u16>,
}

impl ServerAddress {
    /// Creates an address from a hostname and an optional port.
    pub fn new(host: impl Into<String>, port: impl Into<Option<u16>>) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
        }
    }

    /// Parses an address string of the form `host[:port]`.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let invalid = || Error::invalid_argument(format!("invalid server address: {:?}", address));

        let mut parts = address.split(':');
        let host = match parts.next() {
            Some(host) if !host.is_empty() => host,
            _ => return Err(invalid()),
        };

        let port = match parts.next() {
            Some(part) => {
                let port = u16::from_str(part).map_err(|_| invalid())?;
                if port == 0 || parts.next().is_some() {
                    return Err(invalid());
                }
                Some(port)
            }
            None => None,
        };

        Ok(Self::new(host, port))
    }

    /// The hostname of this address.
    pub fn host(&self) -> &str {
        self.host.as_str()
    }

    /// The port of this address, falling back to the default port when none was given.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::new("localhost", None)
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port() == other.port()
    }
}

impl Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        self.host.hash(state);
        self.port().hash(state);
    }
}

impl Display for ServerAddress {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host, self.port())
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(|e| D::Error::custom(format!("{}", e)))
    }
}

impl Serialize for ServerAddress {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Specifies the server API version to declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ServerApiVersion {
    /// Use API version 1.
    V1,
}

impl FromStr for ServerApiVersion {
    type Err = Error;

    fn from_str(str: &str) -> Result<Self> {
        match str {
            "1" => Ok(Self::V1),
            _ => Err(Error::invalid_argument(format!(
                "invalid server api version string: {}",
                str
            ))),
        }
    }
}

impl Display for ServerApiVersion {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::V1 => write!(f, "1"),
        }
    }
}

impl<'de> Deserialize<'de> for ServerApiVersion {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        ServerApiVersion::from_str(&s)
            .map_err(|_| D::Error::invalid_value(Unexpected::Str(&s), &"a valid version number"))
    }
}

impl Serialize for ServerApiVersion {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Options used to declare a versioned server API. Every command sent through a binding that
/// carries a `ServerApi` is stamped with these fields.
#[skip_serializing_none]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ServerApi {
    /// The declared API version.
    #[serde(rename = "apiVersion")]
    #[builder(!default)]
    pub version: ServerApiVersion,

    /// Whether the server should reject all commands that are not part of the declared API
    /// version.
    #[serde(rename = "apiStrict")]
    pub strict: Option<bool>,

    /// Whether the server should return command failures when functionality that is deprecated
    /// from the declared API version is used.
    #[serde(rename = "apiDeprecationErrors")]
    pub deprecation_errors: Option<bool>,
}

impl ServerApi {
    /// Appends this API declaration to an outgoing command.
    pub(crate) fn append_to(&self, command: &mut Document) {
        command.insert("apiVersion", self.version.to_string());
        if let Some(strict) = self.strict {
            command.insert("apiStrict", strict);
        }
        if let Some(deprecation_errors) = self.deprecation_errors {
            command.insert("apiDeprecationErrors", deprecation_errors);
        }
    }
}

/// Settings that govern server selection against a [`Topology`](crate::sdam::Topology).
#[derive(Clone, Debug, Deserialize, PartialEq, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct TopologyOptions {
    /// How long server selection waits for a suitable server before failing.
    ///
    /// The default is 30 seconds.
    #[serde(
        rename = "serverSelectionTimeoutMS",
        default = "default_server_selection_timeout",
        deserialize_with = "deserialize_duration_from_millis"
    )]
    #[builder(default = default_server_selection_timeout())]
    pub server_selection_timeout: Duration,

    /// The width of the latency window, measured from the fastest suitable server, within which
    /// selection picks randomly.
    ///
    /// The default is 15 milliseconds.
    #[serde(
        rename = "localThresholdMS",
        default = "default_local_threshold",
        deserialize_with = "deserialize_duration_from_millis"
    )]
    #[builder(default = default_local_threshold())]
    pub local_threshold: Duration,

    /// The versioned API to declare on every command.
    #[serde(default)]
    pub server_api: Option<ServerApi>,
}

impl Default for TopologyOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn default_server_selection_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_local_threshold() -> Duration {
    Duration::from_millis(15)
}

fn deserialize_duration_from_millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

/// Correlation data for one logical operation, attached to every wire exchange it causes so
/// that trace events can be tied back to the operation.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct RequestContext {
    /// A caller-assigned identifier for the operation.
    pub operation_id: Option<i64>,

    /// A human-readable name for the operation, e.g. `"insert"`.
    pub operation_name: Option<String>,
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::{
        bson::doc,
        options::{ServerAddress, ServerApi, ServerApiVersion, TopologyOptions},
    };

    #[test]
    fn server_address_parsing() {
        let address = ServerAddress::parse("example.com:27018").unwrap();
        assert_eq!(address.host(), "example.com");
        assert_eq!(address.port(), 27018);

        let address = ServerAddress::parse("localhost").unwrap();
        assert_eq!(address, ServerAddress::new("localhost", 27017));
        assert_eq!(address.to_string(), "localhost:27017");

        assert!(ServerAddress::parse("").is_err());
        assert!(ServerAddress::parse("host:port").is_err());
        assert!(ServerAddress::parse("host:1:2").is_err());
    }

    #[test]
    fn topology_options_defaults_and_deserialization() {
        let options = TopologyOptions::default();
        assert_eq!(options.server_selection_timeout, Duration::from_secs(30));
        assert_eq!(options.local_threshold, Duration::from_millis(15));

        let options: TopologyOptions = crate::bson::from_document(doc! {
            "serverSelectionTimeoutMS": 500_i64,
            "serverApi": { "apiVersion": "1", "apiStrict": true },
        })
        .unwrap();
        assert_eq!(options.server_selection_timeout, Duration::from_millis(500));
        assert_eq!(options.local_threshold, Duration::from_millis(15));
        assert_eq!(
            options.server_api,
            Some(
                ServerApi::builder()
                    .version(ServerApiVersion::V1)
                    .strict(true)
                    .build()
            )
        );
    }

    #[test]
    fn server_api_is_appended_to_commands() {
        let api = ServerApi::builder()
            .version(ServerApiVersion::V1)
            .deprecation_errors(false)
            .build();
        let mut command = doc! { "ping": 1 };
        api.append_to(&mut command);
        assert_eq!(
            command,
            doc! { "ping": 1, "apiVersion": "1", "apiDeprecationErrors": false }
        );
    }
}
