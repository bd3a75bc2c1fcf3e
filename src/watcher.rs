//! Pod watcher (spec.md §4.4).
//!
//! Drives a cluster-wide list/watch informer over pods and serially
//! dispatches every event to a single [`EventHandler`] instance on its
//! own task. The watcher is stateless with respect to the work queues
//! — it never reads them and never calls the Subnet Manager — but it
//! keeps a small `uid -> Pod` cache so that a raw `Applied` event (which
//! the `kube` watch stream delivers for both creates and updates) can
//! be classified into `on_add` vs. `on_update`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, Event};
use kube::{Client, ResourceExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::events::EventHandler;

/// Handle to a running watcher task. `stop` is idempotent and resolves
/// only once the dispatch loop has actually exited.
pub struct WatcherHandle {
    token: CancellationToken,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl WatcherHandle {
    /// Cancels the watch loop and waits for it to drain. Safe to call
    /// more than once or concurrently.
    pub async fn stop(&self) {
        self.token.cancel();
        let mut guard = self.task.lock().await;
        if let Some(task) = guard.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "watcher task panicked during shutdown");
            }
        }
    }
}

/// Starts the watcher on a dedicated task, returning a handle that can
/// stop it. `client` is cluster-wide (`Api::all`); namespace scoping is
/// a deployment concern, not a watcher one.
pub fn run_background(client: Client, handler: Arc<EventHandler>) -> WatcherHandle {
    let token = CancellationToken::new();
    let task_token = token.clone();

    let task = tokio::spawn(async move {
        let api: kube::Api<Pod> = kube::Api::all(client);
        let mut cache: HashMap<String, Arc<Pod>> = HashMap::new();
        let mut stream = watcher::watcher(api, watcher::Config::default()).boxed();

        loop {
            tokio::select! {
                _ = task_token.cancelled() => {
                    info!("pod watcher stopping");
                    break;
                }
                next = stream.next() => {
                    match next {
                        None => {
                            info!("pod watch stream ended");
                            break;
                        }
                        Some(Ok(event)) => dispatch(&mut cache, &handler, event).await,
                        Some(Err(e)) => {
                            warn!(error = %e, "pod watch stream error, continuing");
                        }
                    }
                }
            }
        }
    });

    WatcherHandle {
        token,
        task: AsyncMutex::new(Some(task)),
    }
}

async fn dispatch(cache: &mut HashMap<String, Arc<Pod>>, handler: &EventHandler, event: Event<Pod>) {
    match event {
        Event::Applied(pod) => {
            let pod = Arc::new(pod);
            let uid = pod.uid().unwrap_or_default();
            match cache.insert(uid, pod.clone()) {
                Some(old) => handler.on_update(old, pod).await,
                None => handler.on_add(pod).await,
            }
        }
        Event::Deleted(pod) => {
            let pod = Arc::new(pod);
            cache.remove(&pod.uid().unwrap_or_default());
            handler.on_delete(pod).await;
        }
        Event::Restarted(pods) => {
            cache.clear();
            for pod in pods {
                let pod = Arc::new(pod);
                cache.insert(pod.uid().unwrap_or_default(), pod.clone());
                handler.on_add(pod).await;
            }
        }
    }
}
