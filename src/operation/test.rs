use std::sync::Arc;

use pretty_assertions::assert_eq;

use crate::{
    binding::{ClusterBinding, ReadWriteBinding, SessionBinding},
    bson::doc,
    codec::DocumentDecoder,
    concern::{Acknowledgment, WriteConcern},
    error::Error,
    operation::{with_read_connection, with_write_connection, DropUser, Operation, RunCommand},
    options::ServerAddress,
    protocol::{CommandProtocol, Protocol},
    sdam::{ServerType, TopologyType},
    selection_criteria::ReadPreference,
    session::ServerSessionPool,
    test::{standalone, topology, FakeDeployment, TestServer},
    Namespace,
    ReferenceCounted,
};

fn users() -> Namespace {
    Namespace::new("admin", "system.users")
}

#[tokio::test]
async fn connection_and_source_released_after_success() {
    let deployment = FakeDeployment::new();
    let (topology, server) = standalone(&deployment, 21);
    let binding = ClusterBinding::primary(topology);

    let connection = with_write_connection(&binding, |source, connection| async move {
        assert_eq!(source.count(), 1);
        assert_eq!(connection.count(), 1);
        CommandProtocol::new(connection.clone(), "admin", doc! { "ping": 1 }, DocumentDecoder)
            .execute()
            .await?;
        Ok::<_, Error>(connection)
    })
    .await
    .unwrap();

    assert!(connection.is_closed());
    assert_eq!(connection.count(), 0);
    assert_eq!(binding.count(), 1);
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn operation_error_wins_over_release() {
    let deployment = FakeDeployment::new();
    let (topology, _) = standalone(&deployment, 21);
    let binding = ClusterBinding::primary(topology);

    let error = with_read_connection(&binding, |_, connection| async move {
        // Releasing early makes the final release fail; the operation error is still returned.
        connection.release()?;
        let result =
            CommandProtocol::new(connection.clone(), "admin", doc! { "ping": 1 }, DocumentDecoder)
                .execute()
                .await;
        assert!(result.unwrap_err().is_resource_lifecycle_error());
        Err::<(), _>(Error::invalid_argument("operation failed"))
    })
    .await
    .unwrap_err();

    assert!(matches!(
        *error.kind,
        crate::error::ErrorKind::InvalidArgument { .. }
    ));
    assert_eq!(binding.count(), 1);
}

#[tokio::test]
async fn release_failure_surfaces_on_success() {
    let deployment = FakeDeployment::new();
    let (topology, _) = standalone(&deployment, 21);
    let binding = ClusterBinding::primary(topology);

    let error = with_read_connection(&binding, |_, connection| async move {
        connection.release()?;
        Ok::<_, Error>(())
    })
    .await
    .unwrap_err();

    assert!(error.is_resource_lifecycle_error());
    assert_eq!(binding.count(), 1);
}

#[tokio::test]
async fn selection_failure_acquires_nothing() {
    let binding = ClusterBinding::primary(topology(TopologyType::Single, &[]));

    let error = with_write_connection(&binding, |_, _| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(error.is_server_selection_error());
    assert_eq!(binding.count(), 1);
}

#[tokio::test]
async fn cancelled_operation_releases_resources() {
    let deployment = FakeDeployment::new();
    let (topology, _) = standalone(&deployment, 21);
    let pool = Arc::new(ServerSessionPool::new());
    let binding = SessionBinding::implicit(ClusterBinding::primary(topology), &pool);

    let (sender, receiver) = tokio::sync::oneshot::channel();
    let operation = with_read_connection(&binding, |_, connection| async move {
        let _ = sender.send(connection);
        std::future::pending::<crate::error::Result<()>>().await
    });
    let outcome = tokio::time::timeout(std::time::Duration::from_millis(50), operation).await;
    assert!(outcome.is_err());

    let connection = receiver.await.unwrap();
    assert_eq!(connection.count(), 0);
    assert_eq!(binding.count(), 1);

    binding.release().unwrap();
    assert!(binding.session().is_closed());
}

#[tokio::test]
async fn run_command_uses_binding_state() {
    let deployment = FakeDeployment::new();
    let mongos = TestServer::new(&deployment, ServerAddress::default(), ServerType::Mongos, 21);
    let topology = topology(TopologyType::Sharded, &[mongos]);
    let pool = Arc::new(ServerSessionPool::new());
    let binding = SessionBinding::implicit(
        ClusterBinding::new(topology, ReadPreference::Secondary { options: None }),
        &pool,
    );

    let reply = RunCommand::new("db", doc! { "count": "coll" })
        .execute(&binding)
        .await
        .unwrap();
    assert_eq!(reply.get_i32("ok").unwrap(), 1);

    let command = &deployment.commands()[0];
    assert_eq!(command.get_document("lsid").unwrap(), binding.session().id());
    assert_eq!(
        command.get_document("$readPreference").unwrap(),
        &doc! { "mode": "secondary" }
    );
    assert_eq!(command.get_str("$db").unwrap(), "db");
    assert!(binding.session().cluster_time().is_some());
    assert_eq!(binding.count(), 1);

    let error = RunCommand::new("db", doc! {})
        .execute(&binding)
        .await
        .unwrap_err();
    assert!(matches!(
        *error.kind,
        crate::error::ErrorKind::InvalidArgument { .. }
    ));
    assert_eq!(deployment.commands().len(), 1);

    binding.release().unwrap();
    assert!(binding.session().is_closed());
}

#[tokio::test]
async fn drop_user_command() {
    let deployment = FakeDeployment::new();
    deployment.seed(&users(), vec![doc! { "user": "alice" }, doc! { "user": "bob" }]);
    let (topology, _) = standalone(&deployment, 21);
    let binding = ClusterBinding::primary(topology);

    DropUser::new("admin", "alice")
        .write_concern(
            WriteConcern::builder()
                .w(Acknowledgment::Majority)
                .build(),
        )
        .execute(&binding)
        .await
        .unwrap();

    assert_eq!(deployment.requests(), vec!["OP_MSG"]);
    let command = &deployment.commands()[0];
    assert_eq!(command.get_str("dropUser").unwrap(), "alice");
    assert_eq!(
        command.get_document("writeConcern").unwrap(),
        &doc! { "w": "majority" }
    );
    assert_eq!(deployment.documents(&users()), vec![doc! { "user": "bob" }]);

    let error = DropUser::new("admin", "alice")
        .execute(&binding)
        .await
        .unwrap_err();
    assert_eq!(error.code(), Some(11));
    assert_eq!(binding.count(), 1);
}

#[tokio::test]
async fn drop_user_on_legacy_server() {
    let deployment = FakeDeployment::new();
    deployment.seed(&users(), vec![doc! { "user": "alice" }, doc! { "user": "bob" }]);
    let (topology, _) = standalone(&deployment, 1);
    let binding = ClusterBinding::primary(topology);

    DropUser::new("admin", "alice")
        .execute(&binding)
        .await
        .unwrap();

    assert_eq!(deployment.requests(), vec!["OP_DELETE", "OP_QUERY"]);
    assert_eq!(deployment.commands(), vec![doc! { "getlasterror": 1 }]);
    assert_eq!(deployment.documents(&users()), vec![doc! { "user": "bob" }]);
    assert_eq!(binding.count(), 1);
}
