use std::{sync::Arc, time::Duration};

use crate::{
    binding::{ClusterBinding, ConnectionSource, ReadWriteBinding, SessionBinding},
    sdam::TopologyType,
    session::{ClientSession, ServerSessionPool},
    test::{standalone, topology, FakeDeployment},
    ReferenceCounted,
};

fn cluster_binding() -> ClusterBinding {
    let (topology, _) = standalone(&FakeDeployment::new(), 21);
    ClusterBinding::primary(topology)
}

#[tokio::test]
async fn cluster_source_holds_binding_reference() {
    let binding = cluster_binding();
    let source = binding.read_connection_source().await.unwrap();
    assert_eq!(binding.count(), 2);
    assert_eq!(source.count(), 1);

    binding.release().unwrap();
    assert_eq!(binding.count(), 1);

    source.retain().unwrap();
    source.release().unwrap();
    assert_eq!(binding.count(), 1);

    source.release().unwrap();
    assert_eq!(binding.count(), 0);

    let error = source.release().unwrap_err();
    assert!(error.is_resource_lifecycle_error());
    let error = binding.read_connection_source().await.err().unwrap();
    assert!(error.is_resource_lifecycle_error());
}

#[tokio::test]
async fn selection_failure_does_not_leak_references() {
    let pool = Arc::new(ServerSessionPool::new());
    let binding = SessionBinding::implicit(
        ClusterBinding::primary(topology(TopologyType::Single, &[])),
        &pool,
    );

    let error = binding.write_connection_source().await.err().unwrap();
    assert!(error.is_server_selection_error());
    assert_eq!(binding.count(), 1);
    assert_eq!(binding.inner().count(), 1);
    assert!(!binding.session().is_closed());

    binding.release().unwrap();
    assert!(binding.session().is_closed());
    assert_eq!(binding.inner().count(), 0);
}

#[tokio::test]
async fn cancelled_acquisition_does_not_leak_references() {
    let pool = Arc::new(ServerSessionPool::new());
    let binding = SessionBinding::implicit(
        ClusterBinding::primary(topology(TopologyType::Single, &[])),
        &pool,
    );

    // Selection waits up to 200ms; the deadline drops the acquisition mid-selection.
    let acquisition = tokio::time::timeout(
        Duration::from_millis(20),
        binding.read_connection_source(),
    )
    .await;
    assert!(acquisition.is_err());
    assert_eq!(binding.count(), 1);
    assert_eq!(binding.inner().count(), 1);

    binding.release().unwrap();
    assert!(binding.session().is_closed());
    assert_eq!(binding.inner().count(), 0);
    assert_eq!(pool.len(), 1);
}

#[tokio::test]
async fn acquisition_after_release_fails() {
    let pool = Arc::new(ServerSessionPool::new());
    let binding = SessionBinding::implicit(cluster_binding(), &pool);
    binding.release().unwrap();

    let error = binding.read_connection_source().await.err().unwrap();
    assert!(error.is_resource_lifecycle_error());
    assert_eq!(binding.inner().count(), 0);
}

#[tokio::test]
async fn owned_session_closes_after_last_source() {
    let pool = Arc::new(ServerSessionPool::new());
    let binding = SessionBinding::implicit(cluster_binding(), &pool);
    let session = binding.session().clone();

    let read_source = binding.read_connection_source().await.unwrap();
    let write_source = binding.write_connection_source().await.unwrap();
    assert_eq!(binding.count(), 3);

    binding.release().unwrap();
    assert!(!session.is_closed());

    write_source.release().unwrap();
    assert!(!session.is_closed());

    read_source.release().unwrap();
    assert!(session.is_closed());
    assert_eq!(pool.len(), 1);
    assert_eq!(binding.inner().count(), 0);
}

#[tokio::test]
async fn release_order_does_not_matter() {
    let pool = Arc::new(ServerSessionPool::new());
    let binding = SessionBinding::implicit(cluster_binding(), &pool);

    let write_source = binding.write_connection_source().await.unwrap();
    let read_source = binding.read_connection_source().await.unwrap();

    read_source.release().unwrap();
    write_source.release().unwrap();
    assert!(!binding.session().is_closed());

    binding.release().unwrap();
    assert!(binding.session().is_closed());
    assert_eq!(pool.len(), 1);
}

#[tokio::test]
async fn explicit_session_is_never_closed() {
    let pool = Arc::new(ServerSessionPool::new());
    let session = Arc::new(ClientSession::new(&pool, true));
    let binding = SessionBinding::explicit(cluster_binding(), session.clone());

    let source = binding.read_connection_source().await.unwrap();
    assert!(!source.session_context().is_implicit_session());
    binding.release().unwrap();
    source.release().unwrap();

    assert_eq!(binding.count(), 0);
    assert_eq!(binding.inner().count(), 0);
    assert!(!session.is_closed());
    assert!(pool.is_empty());
}

#[tokio::test]
async fn sources_report_session_context() {
    let pool = Arc::new(ServerSessionPool::new());
    let binding = SessionBinding::implicit(cluster_binding(), &pool);

    let source = binding.write_connection_source().await.unwrap();
    let context = source.session_context();
    assert!(context.has_session());
    assert!(context.is_implicit_session());
    assert_eq!(context.session_id().as_ref(), Some(binding.session().id()));

    let connection = source.connection().await.unwrap();
    assert_eq!(connection.count(), 1);
    connection.release().unwrap();
    assert!(connection.is_closed());

    source.release().unwrap();
    binding.release().unwrap();
}

#[tokio::test]
async fn closed_session_fails_connection_checkout() {
    let pool = Arc::new(ServerSessionPool::new());
    let session = Arc::new(ClientSession::new(&pool, false));
    let binding = SessionBinding::explicit(cluster_binding(), session.clone());
    let source = binding.read_connection_source().await.unwrap();

    session.close().unwrap();
    let error = source.connection().await.unwrap_err();
    assert!(error.is_resource_lifecycle_error());

    source.release().unwrap();
    binding.release().unwrap();
}

#[tokio::test]
async fn session_close_failure_still_releases_inner_binding() {
    let pool = Arc::new(ServerSessionPool::new());
    let session = Arc::new(ClientSession::new(&pool, false));
    session.close().unwrap();

    let binding = SessionBinding::new(cluster_binding(), session, true);
    let error = binding.release().unwrap_err();
    assert!(error.is_resource_lifecycle_error());
    assert_eq!(binding.inner().count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_releases_close_session_once() {
    let pool = Arc::new(ServerSessionPool::new());
    let binding = SessionBinding::implicit(cluster_binding(), &pool);

    let mut sources: Vec<Arc<dyn ConnectionSource>> = Vec::new();
    for _ in 0..16 {
        sources.push(binding.read_connection_source().await.unwrap());
    }
    binding.release().unwrap();

    let handles: Vec<_> = sources
        .into_iter()
        .map(|source| tokio::spawn(async move { source.release() }))
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(binding.session().is_closed());
    assert_eq!(pool.len(), 1);
    assert_eq!(binding.count(), 0);
}
