use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{options::ServerAddress, selection_criteria::TagSet};

/// The possible types for a server.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, derive_more::Display)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    #[serde(rename = "RSPrimary")]
    RsPrimary,

    /// A secondary node in a replica set.
    #[serde(rename = "RSSecondary")]
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    #[serde(rename = "RSArbiter")]
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    #[serde(rename = "RSOther")]
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the
    /// replica set config.
    #[serde(rename = "RSGhost")]
    RsGhost,

    /// A load-balancing proxy between the driver and the deployment.
    LoadBalancer,

    /// A server that the driver hasn't yet communicated with or can't connect to.
    #[default]
    Unknown,
}

impl ServerType {
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
                | ServerType::LoadBalancer
        )
    }

    pub(crate) fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

/// The possible types for a topology.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, derive_more::Display)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single mongod server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A load balanced topology.
    LoadBalanced,

    /// A topology whose type is not known.
    #[default]
    Unknown,
}

/// What is known about one server of the deployment.
#[derive(Clone, Debug, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ServerDescription {
    /// The address of the server.
    #[builder(!default)]
    pub address: ServerAddress,

    /// The role the server plays in the deployment.
    pub server_type: ServerType,

    /// The moving average of the server's round trip times.
    #[builder(setter(strip_option))]
    pub average_round_trip_time: Option<Duration>,

    /// The replica set tags of the server.
    pub tags: TagSet,
}

impl ServerDescription {
    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        tag_set
            .iter()
            .all(|(key, value)| self.tags.get(key) == Some(value))
    }
}

impl fmt::Display for ServerDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{ Address: {}, Type: {}", self.address, self.server_type)?;
        if let Some(rtt) = self.average_round_trip_time {
            write!(f, ", Average RTT: {:?}", rtt)?;
        }
        if !self.tags.is_empty() {
            write!(f, ", Tags: {:?}", self.tags)?;
        }
        write!(f, " }}")
    }
}

/// A snapshot of the whole deployment.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct ClusterDescription {
    /// The type of the deployment.
    pub topology_type: TopologyType,

    /// The known servers.
    pub servers: Vec<ServerDescription>,
}

impl ClusterDescription {
    pub(crate) fn has_available_servers(&self) -> bool {
        self.servers
            .iter()
            .any(|server| server.server_type.is_available())
    }

    pub(crate) fn servers_with_type<'a>(
        &'a self,
        types: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> {
        self.servers
            .iter()
            .filter(move |server| types.contains(&server.server_type))
    }
}

impl fmt::Display for ClusterDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::result::Result<(), fmt::Error> {
        write!(f, "{{ Type: {}", self.topology_type)?;

        if !self.servers.is_empty() {
            write!(f, ", Servers: [ ")?;
            let mut iter = self.servers.iter();
            if let Some(server) = iter.next() {
                write!(f, "{}", server)?;
            }
            for server in iter {
                write!(f, ", {}", server)?;
            }
            write!(f, " ]")?;
        }

        write!(f, " }}")
    }
}
