use std::sync::Arc;

use crate::{
    bson::{doc, Timestamp},
    session::{
        ClientSession,
        ClientSessionContext,
        ClusterTime,
        NoSessionContext,
        ServerSessionPool,
        SessionContext,
    },
};

fn cluster_time(time: u32) -> ClusterTime {
    ClusterTime {
        cluster_time: Timestamp { time, increment: 1 },
        signature: doc! {},
    }
}

#[test]
fn close_returns_server_session_exactly_once() {
    let pool = Arc::new(ServerSessionPool::new());
    let session = ClientSession::new(&pool, false);
    assert!(pool.is_empty());

    session.close().unwrap();
    assert!(session.is_closed());
    assert_eq!(pool.len(), 1);

    let error = session.close().unwrap_err();
    assert!(error.is_resource_lifecycle_error());
    assert_eq!(pool.len(), 1);
}

#[test]
fn server_sessions_are_reused() {
    let pool = Arc::new(ServerSessionPool::new());
    let first = ClientSession::new(&pool, false);
    let id = first.id().clone();
    first.close().unwrap();

    let second = ClientSession::new(&pool, true);
    assert_eq!(second.id(), &id);
    assert!(pool.is_empty());
}

#[test]
fn times_only_advance() {
    let pool = Arc::new(ServerSessionPool::new());
    let session = ClientSession::new(&pool, true);

    session.advance_cluster_time(&cluster_time(10));
    session.advance_cluster_time(&cluster_time(5));
    assert_eq!(session.cluster_time(), Some(cluster_time(10)));

    session.advance_operation_time(Timestamp {
        time: 7,
        increment: 0,
    });
    session.advance_operation_time(Timestamp {
        time: 3,
        increment: 0,
    });
    assert_eq!(session.operation_time().map(|ts| ts.time), Some(7));
}

#[test]
fn contexts() {
    let no_session = NoSessionContext;
    assert!(!no_session.has_session());
    assert!(no_session.session_id().is_none());
    assert!(no_session.ensure_usable().is_ok());

    let pool = Arc::new(ServerSessionPool::new());
    let session = Arc::new(ClientSession::new(&pool, true));
    let context = ClientSessionContext::new(session.clone(), true);
    assert!(context.has_session());
    assert!(context.is_implicit_session());
    assert!(context.is_causally_consistent());
    assert_eq!(context.session_id().as_ref(), Some(session.id()));

    session.close().unwrap();
    assert!(context
        .ensure_usable()
        .unwrap_err()
        .is_resource_lifecycle_error());
}
