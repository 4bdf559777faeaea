use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};

/// Runtime used when a task is spawned outside of any tokio context, for
/// example from a listener registration dropped on a plain thread.
static BACKGROUND_RUNTIME: LazyLock<Option<Runtime>> = LazyLock::new(|| {
    match Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("firestore-sync-background")
        .enable_all()
        .build()
    {
        Ok(runtime) => Some(runtime),
        Err(err) => {
            log::error!("failed to build background tokio runtime: {err}");
            None
        }
    }
});

/// Spawns an async task that runs in the background.
///
/// Uses the ambient tokio runtime when there is one.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else if let Some(runtime) = BACKGROUND_RUNTIME.as_ref() {
        runtime.spawn(future);
    } else {
        log::warn!("dropping background task: no tokio runtime available");
    }
}

/// Asynchronously waits for the provided duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}
