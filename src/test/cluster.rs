use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::FutureExt;

use crate::{
    cmap::Connection,
    error::Result,
    options::{ServerAddress, TopologyOptions},
    sdam::{Server, ServerDescription, ServerType, Topology, TopologyType},
    test::{description_for, FakeDeployment},
    BoxFuture,
};

/// A server of a [`FakeDeployment`], counting the connections checked out from it.
pub(crate) struct TestServer {
    description: ServerDescription,
    max_wire_version: i32,
    deployment: FakeDeployment,
    connections: AtomicUsize,
}

impl TestServer {
    pub(crate) fn new(
        deployment: &FakeDeployment,
        address: ServerAddress,
        server_type: ServerType,
        max_wire_version: i32,
    ) -> Arc<Self> {
        Arc::new(Self {
            description: ServerDescription::builder()
                .address(address)
                .server_type(server_type)
                .build(),
            max_wire_version,
            deployment: deployment.clone(),
            connections: AtomicUsize::new(0),
        })
    }

    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Server for TestServer {
    fn description(&self) -> ServerDescription {
        self.description.clone()
    }

    fn connection(&self) -> BoxFuture<'_, Result<Connection>> {
        async move {
            self.connections.fetch_add(1, Ordering::SeqCst);
            Ok(self.deployment.connect(description_for(
                self.description.address.clone(),
                self.description.server_type,
                self.max_wire_version,
            )))
        }
        .boxed()
    }
}

/// Creates a topology selecting among `servers`, failing selection after a short timeout.
pub(crate) fn topology(topology_type: TopologyType, servers: &[Arc<TestServer>]) -> Arc<Topology> {
    let options = TopologyOptions::builder()
        .server_selection_timeout(Duration::from_millis(200))
        .build();
    let topology = Topology::new(topology_type, options);
    for server in servers {
        topology.upsert_server(server.clone());
    }
    Arc::new(topology)
}

/// A standalone server of `deployment` and a topology containing just it.
pub(crate) fn standalone(
    deployment: &FakeDeployment,
    max_wire_version: i32,
) -> (Arc<Topology>, Arc<TestServer>) {
    let server = TestServer::new(
        deployment,
        ServerAddress::default(),
        ServerType::Standalone,
        max_wire_version,
    );
    (topology(TopologyType::Single, &[server.clone()]), server)
}
