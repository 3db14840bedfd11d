use std::sync::Arc;

use pretty_assertions::assert_eq;

use crate::{
    binding::{ClusterBinding, SessionBinding},
    bson::doc,
    codec::DocumentDecoder,
    operation::{DropUser, RunCommand},
    options::RequestContext,
    protocol::{InsertRequest, QueryOptions, UpdateRequest},
    session::ServerSessionPool,
    sync::Binding,
    test::{standalone, FakeDeployment, Script},
    Namespace,
    ReferenceCounted,
};

#[test]
fn blocking_writes_and_reads() {
    let deployment = FakeDeployment::new();
    let (topology, _) = standalone(&deployment, 21);
    let pool = Arc::new(ServerSessionPool::new());
    let binding = Binding::new(SessionBinding::implicit(
        ClusterBinding::primary(topology),
        &pool,
    ));
    let namespace = Namespace::new("db", "coll");
    let context = RequestContext::default();

    let source = binding.write_connection_source().unwrap();
    let connection = source.connection().unwrap();

    let inserted = connection
        .insert(
            &namespace,
            true,
            InsertRequest::new(doc! { "_id": 1 }),
            &context,
        )
        .unwrap();
    assert_eq!(inserted.count, 1);

    let updated = connection
        .update(
            &namespace,
            true,
            UpdateRequest::builder()
                .filter(doc! { "_id": 1 })
                .update(doc! { "$set": { "x": 1 } })
                .build(),
            &context,
        )
        .unwrap();
    assert!(updated.is_update_of_existing());

    let found = connection
        .query(
            &namespace,
            doc! {},
            QueryOptions::default(),
            DocumentDecoder,
            &context,
        )
        .unwrap();
    assert_eq!(found.results, vec![doc! { "_id": 1, "x": 1 }]);

    connection.release().unwrap();
    assert!(connection.is_closed());
    source.release().unwrap();
    assert!(!binding.as_async().session().is_closed());

    binding.release().unwrap();
    assert!(binding.as_async().session().is_closed());
    assert_eq!(pool.len(), 1);
}

#[test]
fn blocking_failures_match_async() {
    let deployment = FakeDeployment::new();
    let (topology, _) = standalone(&deployment, 21);
    let binding = Binding::new(ClusterBinding::primary(topology));
    let source = binding.read_connection_source().unwrap();
    let connection = source.connection().unwrap();

    let error = connection
        .get_more(
            &Namespace::new("db", "coll"),
            99,
            0,
            DocumentDecoder,
            &RequestContext::default(),
        )
        .unwrap_err();
    assert!(error.is_cursor_not_found());

    deployment.script(Script::Hangup);
    let error = connection
        .kill_cursors(&Namespace::new("db", "coll"), vec![1], &RequestContext::default())
        .unwrap_err();
    assert!(error.is_network_error());
    assert!(connection.is_closed());

    connection.release().unwrap();
    source.release().unwrap();
    assert_eq!(binding.count(), 1);
}

#[test]
fn blocking_operations() {
    let deployment = FakeDeployment::new();
    deployment.seed(
        &Namespace::new("admin", "system.users"),
        vec![doc! { "user": "alice" }],
    );
    let (topology, server) = standalone(&deployment, 3);
    let binding = Binding::new(ClusterBinding::primary(topology));

    let reply = binding
        .execute(RunCommand::new("admin", doc! { "ping": 1 }))
        .unwrap();
    assert_eq!(reply.get_i32("ok").unwrap(), 1);

    binding.execute(DropUser::new("admin", "alice")).unwrap();
    assert!(deployment
        .documents(&Namespace::new("admin", "system.users"))
        .is_empty());

    assert_eq!(server.connections(), 2);
    assert_eq!(binding.count(), 1);
    binding.release().unwrap();
    assert!(binding.read_connection_source().unwrap_err().is_resource_lifecycle_error());
}
