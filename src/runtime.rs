use std::{future::Future, sync::LazyLock, time::Duration};

use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// The runtime backing the blocking and callback-driven execution paths when the caller is not
/// already running inside a tokio runtime.
pub(crate) static TOKIO_RUNTIME: LazyLock<tokio::runtime::Runtime> =
    LazyLock::new(|| match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => panic!(
            "Error occurred when starting the underlying async runtime: {}",
            err
        ),
    });

/// Spawn a task in the background to run a future.
///
/// The task runs on the ambient tokio runtime when there is one, and on the crate's own runtime
/// otherwise.
pub(crate) fn spawn<F, O>(fut: F) -> JoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle.spawn(fut),
        Err(_) => TOKIO_RUNTIME.spawn(fut),
    }
}

/// Run `fut` to completion on the current thread.
///
/// Must not be called from within an async context that is driving other work on the same
/// thread; inside a multi-threaded runtime the blocking is moved off the worker with
/// `block_in_place`.
pub(crate) fn block_on<F, T>(fut: F) -> T
where
    F: Future<Output = T>,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => tokio::task::block_in_place(|| handle.block_on(fut)),
        Err(_) => TOKIO_RUNTIME.block_on(fut),
    }
}

/// Await a future for a maximum amount of time.
///
/// If the future completes before the timeout, its output is returned. Otherwise, `on_timeout`
/// is called to build the error.
pub(crate) async fn timeout<F: Future>(
    timeout: Duration,
    future: F,
    on_timeout: impl FnOnce() -> Error,
) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| on_timeout())
}

/// Delay for the specified duration.
#[cfg(test)]
pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}
