//! The view of the deployment that connection sources resolve against.
//!
//! Discovering and monitoring servers happens elsewhere; whatever does it publishes its results
//! into a [`Topology`] as [`Server`]s carrying their current [`ServerDescription`]. Bindings only
//! consume the [`Cluster`] contract: given selection criteria, return a suitable server or fail
//! once the server selection timeout elapses.

mod description;
mod server_selection;
mod topology;

use std::sync::Arc;

pub use self::{
    description::{ClusterDescription, ServerDescription, ServerType, TopologyType},
    topology::Topology,
};
use crate::{
    cmap::Connection,
    error::Result,
    options::ServerApi,
    selection_criteria::SelectionCriteria,
    BoxFuture,
};

/// A cluster that can select a server for an operation.
pub trait Cluster: Send + Sync {
    /// A snapshot of the cluster's current description.
    fn description(&self) -> ClusterDescription;

    /// Selects a server satisfying `criteria`, waiting up to the server selection timeout for
    /// one to become available.
    fn select_server<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
    ) -> BoxFuture<'a, Result<Arc<dyn Server>>>;

    /// The versioned API declared on every command sent to this cluster, if any.
    fn server_api(&self) -> Option<ServerApi> {
        None
    }
}

/// One server of a cluster, able to hand out connections to itself.
pub trait Server: Send + Sync {
    /// The server's current description.
    fn description(&self) -> ServerDescription;

    /// Checks out a connection to this server. The caller owns the connection's initial
    /// reference.
    fn connection(&self) -> BoxFuture<'_, Result<Connection>>;
}
