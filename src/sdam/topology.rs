use std::{collections::HashMap, sync::Arc, time::Instant};

use futures_util::FutureExt;
use tokio::sync::watch;

use crate::{
    error::{Error, Result},
    options::{ServerAddress, ServerApi, TopologyOptions},
    runtime,
    sdam::{Cluster, ClusterDescription, Server, ServerDescription, TopologyType},
    selection_criteria::SelectionCriteria,
    trace::{TracingRepresentation, SERVER_SELECTION_TRACING_EVENT_TARGET},
    BoxFuture,
};

/// A [`Cluster`] whose membership is published by an external monitor.
///
/// Server selection reads the latest published state; when no server is suitable it waits for
/// the next publication, until the server selection timeout elapses.
pub struct Topology {
    options: TopologyOptions,
    state: watch::Sender<TopologyState>,
}

struct TopologyState {
    topology_type: TopologyType,
    servers: HashMap<ServerAddress, Arc<dyn Server>>,
}

impl TopologyState {
    fn description(&self) -> ClusterDescription {
        let mut servers: Vec<ServerDescription> = self
            .servers
            .values()
            .map(|server| server.description())
            .collect();
        servers.sort_by(|a, b| a.address.to_string().cmp(&b.address.to_string()));
        ClusterDescription {
            topology_type: self.topology_type,
            servers,
        }
    }
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("options", &self.options)
            .field("description", &self.description())
            .finish()
    }
}

impl Topology {
    /// Creates an empty topology of the given type.
    pub fn new(topology_type: TopologyType, options: TopologyOptions) -> Self {
        let (state, _) = watch::channel(TopologyState {
            topology_type,
            servers: HashMap::new(),
        });
        Self { options, state }
    }

    /// The options this topology selects servers with.
    pub fn options(&self) -> &TopologyOptions {
        &self.options
    }

    /// Adds `server`, replacing any server already known at the same address.
    pub fn upsert_server(&self, server: Arc<dyn Server>) {
        let address = server.description().address;
        self.state.send_modify(|state| {
            state.servers.insert(address, server);
        });
    }

    /// Removes the server at `address`, if it is known.
    pub fn remove_server(&self, address: &ServerAddress) {
        self.state.send_modify(|state| {
            state.servers.remove(address);
        });
    }

    /// Changes the type of the topology.
    pub fn set_topology_type(&self, topology_type: TopologyType) {
        self.state.send_modify(|state| {
            state.topology_type = topology_type;
        });
    }

    fn attempt_to_select_server(
        &self,
        state: &TopologyState,
        criteria: &SelectionCriteria,
    ) -> Option<Arc<dyn Server>> {
        let description = state.description();
        let selected = description.select_server(criteria, self.options.local_threshold)?;
        state.servers.get(&selected.address).cloned()
    }

    async fn select_server_inner(&self, criteria: &SelectionCriteria) -> Result<Arc<dyn Server>> {
        let start_time = Instant::now();
        let mut watcher = self.state.subscribe();

        tracing::debug!(
            target: SERVER_SELECTION_TRACING_EVENT_TARGET,
            selector = criteria.tracing_representation(),
            topologyDescription = self.description().to_string(),
            "Server selection started",
        );

        let mut logged_waiting = false;
        let selection = async {
            loop {
                let selected = {
                    let state = watcher.borrow_and_update();
                    self.attempt_to_select_server(&state, criteria)
                };
                if let Some(server) = selected {
                    return Ok(server);
                }

                if !logged_waiting {
                    tracing::info!(
                        target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                        selector = criteria.tracing_representation(),
                        remainingTimeMS = self
                            .options
                            .server_selection_timeout
                            .saturating_sub(start_time.elapsed())
                            .as_millis(),
                        "Waiting for suitable server to become available",
                    );
                    logged_waiting = true;
                }

                if watcher.changed().await.is_err() {
                    return Err(Error::server_selection("the topology was closed"));
                }
            }
        };

        let result = runtime::timeout(self.options.server_selection_timeout, selection, || {
            Error::server_selection(
                self.description()
                    .server_selection_timeout_error_message(criteria),
            )
        })
        .await
        .and_then(std::convert::identity);

        match result {
            Ok(ref server) => {
                let address = server.description().address;
                tracing::debug!(
                    target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                    selector = criteria.tracing_representation(),
                    serverHost = address.host(),
                    serverPort = address.port_tracing_representation(),
                    "Server selection succeeded",
                );
            }
            Err(ref error) => {
                tracing::debug!(
                    target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                    selector = criteria.tracing_representation(),
                    failure = error.tracing_representation(),
                    "Server selection failed",
                );
            }
        }

        result
    }
}

impl Cluster for Topology {
    fn description(&self) -> ClusterDescription {
        self.state.borrow().description()
    }

    fn select_server<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
    ) -> BoxFuture<'a, Result<Arc<dyn Server>>> {
        self.select_server_inner(criteria).boxed()
    }

    fn server_api(&self) -> Option<ServerApi> {
        self.options.server_api.clone()
    }
}
