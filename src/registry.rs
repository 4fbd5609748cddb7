//! Per-operation bookkeeping: one `CancellationToken`, temp directory, and
//! progress subscriber list per `OperationId`, so a desktop session can run
//! more than one pipeline concurrently. Generalizes the teacher's single
//! process-wide `Arc<AtomicBool>` cancellation flag.

use crate::cancel::CancellationToken;
use crate::progress::{ProgressEvent, ProgressSink};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

pub type OperationId = String;

struct OperationHandle {
    token: CancellationToken,
    temp_dir: std::path::PathBuf,
    subscribers: Mutex<Vec<Arc<dyn ProgressSink>>>,
    last_event: Mutex<Option<ProgressEvent>>,
}

#[derive(Default)]
pub struct OperationRegistry {
    operations: RwLock<HashMap<OperationId, Arc<OperationHandle>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, op_id: OperationId, temp_dir: std::path::PathBuf) -> CancellationToken {
        let token = CancellationToken::new();
        let handle = Arc::new(OperationHandle {
            token: token.clone(),
            temp_dir,
            subscribers: Mutex::new(Vec::new()),
            last_event: Mutex::new(None),
        });
        self.operations.write().await.insert(op_id, handle);
        token
    }

    pub async fn subscribe(&self, op_id: &str, sink: Arc<dyn ProgressSink>) {
        if let Some(handle) = self.operations.read().await.get(op_id) {
            handle.subscribers.lock().await.push(sink);
        }
    }

    pub async fn record_progress(&self, op_id: &str, event: ProgressEvent) {
        if let Some(handle) = self.operations.read().await.get(op_id) {
            *handle.last_event.lock().await = Some(event.clone());
            for sub in handle.subscribers.lock().await.iter() {
                sub.publish(event.clone());
            }
        }
    }

    /// Fires the operation's token and schedules temp-dir cleanup. Child
    /// process termination happens implicitly: every C1 call races the
    /// token via `tokio::select!`, so in-flight ffmpeg children are killed
    /// when their `Child` handle drops out of scope.
    pub async fn cancel(&self, op_id: &str) {
        let handle = self.operations.write().await.remove(op_id);
        if let Some(handle) = handle {
            handle.token.cancel();
            let temp_dir = handle.temp_dir.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::fs::remove_dir_all(&temp_dir).await {
                    warn!(error = %e, path = %temp_dir.display(), "failed to clean up operation temp dir");
                }
            });
            info!(op_id, "operation cancelled");
        }
    }

    pub async fn complete(&self, op_id: &str) {
        if let Some(handle) = self.operations.write().await.remove(op_id) {
            let temp_dir = handle.temp_dir.clone();
            tokio::spawn(async move {
                let _ = tokio::fs::remove_dir_all(&temp_dir).await;
            });
        }
    }

    /// Cancels every tracked operation, for use when the originating UI
    /// session disappears. The registry has no notion of sessions itself;
    /// callers own that mapping and call this from their disconnect hook.
    pub async fn cancel_all(&self) {
        let ids: Vec<OperationId> = self.operations.read().await.keys().cloned().collect();
        for id in ids {
            self.cancel(&id).await;
        }
    }

    /// Spawns a background ticker that re-emits each active operation's
    /// last known progress roughly every 5 seconds, so clients waiting
    /// through a quiet phase (save dialog, long encode) don't time out.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                let snapshot: Vec<(OperationId, Arc<OperationHandle>)> = registry
                    .operations
                    .read()
                    .await
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                for (op_id, handle) in snapshot {
                    if handle.token.is_cancelled() {
                        continue;
                    }
                    if let Some(last) = handle.last_event.lock().await.clone() {
                        for sub in handle.subscribers.lock().await.iter() {
                            sub.publish(last.clone());
                        }
                    }
                    let _ = op_id;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_cancel_marks_token_cancelled() {
        let registry = OperationRegistry::new();
        let token = registry.register("op-1".to_string(), std::env::temp_dir().join("op-1-test")).await;
        assert!(!token.is_cancelled());
        registry.cancel("op-1").await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_all_cancels_every_registered_operation() {
        let registry = OperationRegistry::new();
        let t1 = registry.register("a".to_string(), std::env::temp_dir().join("reg-a")).await;
        let t2 = registry.register("b".to_string(), std::env::temp_dir().join("reg-b")).await;
        registry.cancel_all().await;
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_on_unknown_operation_is_a_no_op() {
        let registry = OperationRegistry::new();
        registry.cancel("does-not-exist").await;
    }
}
