//! The connection and session binding layer of a MongoDB driver.
//!
//! This crate turns a logical operation (insert, update, delete, command, query, getMore,
//! killCursors) into a wire protocol exchange against a specific server, while managing the
//! lifetime of the connection and of any client session attached to the operation.
//!
//! The main pieces are:
//!
//! - [`Connection`](cmap::Connection): a reference-counted wire protocol channel to one server.
//! - [`ConnectionSource`](binding::ConnectionSource): a reference-counted handle yielding
//!   connections to a server selected for a read or write intent.
//! - [`ReadWriteBinding`](binding::ReadWriteBinding): the unit an operation executor receives,
//!   pairing server selection with a session context.
//! - [`SessionBinding`](binding::SessionBinding): a binding decorator that attaches a client
//!   session to every connection source it produces and closes an owned session exactly when
//!   the last reference derived from the binding is released.
//! - The [`protocol`] executors, which run one wire exchange per operation on both the async and
//!   the blocking paths.
//!
//! Reference counting is explicit: every [`retain`](ReferenceCounted::retain) must be paired with
//! exactly one [`release`](ReferenceCounted::release), and releasing more often than retaining is
//! reported as an [`ErrorKind::ResourceLifecycle`](error::ErrorKind::ResourceLifecycle) error.
//!
//! ```no_run
//! # async fn run(topology: std::sync::Arc<mongodb_binding::sdam::Topology>) -> mongodb_binding::error::Result<()> {
//! use mongodb_binding::{
//!     binding::{ClusterBinding, ReadWriteBinding, SessionBinding},
//!     bson::doc,
//!     session::ServerSessionPool,
//!     ReferenceCounted,
//! };
//!
//! let pool = std::sync::Arc::new(ServerSessionPool::new());
//! let binding = SessionBinding::implicit(ClusterBinding::primary(topology), &pool);
//!
//! let source = binding.write_connection_source().await?;
//! let connection = source.connection().await?;
//! // ... run protocol operations over `connection` ...
//! connection.release()?;
//! source.release()?;
//!
//! // The implicit session is closed here, after the last reference is gone.
//! binding.release()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use ::bson;

pub mod binding;
mod bson_util;
pub mod cmap;
pub mod codec;
pub mod concern;
pub mod error;
mod namespace;
pub mod operation;
pub mod options;
pub mod protocol;
mod ref_count;
pub mod results;
mod runtime;
pub mod sdam;
pub mod selection_criteria;
pub mod session;
#[cfg(any(feature = "sync", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "sync")))]
pub mod sync;
mod trace;
pub mod validation;

pub use crate::{
    cmap::Connection,
    namespace::Namespace,
    ref_count::ReferenceCounted,
};

pub use futures_core::future::BoxFuture;
