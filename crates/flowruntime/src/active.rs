//! The set of executors currently attached to flows in this process.

use flowcore::{FlowId, PauseCondition};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Cooperative signals from operators to a running executor
#[derive(Debug, Default)]
pub struct FlowControl {
    pause: Mutex<Option<PauseCondition>>,
    cancel: CancellationToken,
}

impl FlowControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a pause at the next batch boundary. The first request wins.
    pub fn request_pause(&self, condition: PauseCondition) {
        let mut pause = self.pause.lock().unwrap_or_else(|e| e.into_inner());
        if pause.is_none() {
            *pause = Some(condition);
        }
    }

    pub fn take_pause(&self) -> Option<PauseCondition> {
        self.pause.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

struct ExecutorEntry {
    run_id: Uuid,
    control: Arc<FlowControl>,
    done: watch::Receiver<bool>,
}

/// Tracks one executor per flow and lets callers await settlement
#[derive(Default)]
pub struct ExecutorRegistry {
    entries: Mutex<HashMap<FlowId, ExecutorEntry>>,
    /// Flows a command is about to attach, with the number of open claims.
    claims: Mutex<HashMap<FlowId, usize>>,
}

/// Keeps a flow owned by this process between the write that makes it
/// `Running` and the attach of its executor. Released on drop.
pub struct AttachClaim {
    registry: Arc<ExecutorRegistry>,
    flow_id: FlowId,
}

impl Drop for AttachClaim {
    fn drop(&mut self) {
        let mut claims = self.registry.claims();
        if let Some(open) = claims.get_mut(&self.flow_id) {
            *open -= 1;
            if *open == 0 {
                claims.remove(&self.flow_id);
            }
        }
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<FlowId, ExecutorEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claims(&self) -> MutexGuard<'_, HashMap<FlowId, usize>> {
        self.claims.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_attached(&self, flow_id: FlowId) -> bool {
        self.entries().contains_key(&flow_id)
    }

    /// Attached, or claimed by a command that has not attached yet.
    pub fn is_owned(&self, flow_id: FlowId) -> bool {
        self.is_attached(flow_id) || self.claims().contains_key(&flow_id)
    }

    /// Claim the flow before persisting it as `Running`.
    pub fn claim(self: &Arc<Self>, flow_id: FlowId) -> AttachClaim {
        *self.claims().entry(flow_id).or_default() += 1;
        AttachClaim {
            registry: Arc::clone(self),
            flow_id,
        }
    }

    pub fn control(&self, flow_id: FlowId) -> Option<Arc<FlowControl>> {
        self.entries().get(&flow_id).map(|e| Arc::clone(&e.control))
    }

    pub fn attached(&self) -> Vec<FlowId> {
        self.entries().keys().copied().collect()
    }

    /// Wait until no executor is attached to the flow.
    pub async fn wait(&self, flow_id: FlowId) {
        loop {
            let done = match self.entries().get(&flow_id) {
                Some(entry) => entry.done.clone(),
                None => return,
            };
            wait_done(done).await;
        }
    }

    /// Spawn `run` as the flow's executor once any previous executor is gone.
    pub(crate) async fn attach<F, Fut>(self: &Arc<Self>, flow_id: FlowId, run: F)
    where
        F: FnOnce(Arc<FlowControl>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            let previous = {
                let mut entries = self.entries();
                match entries.get(&flow_id) {
                    Some(entry) => entry.done.clone(),
                    None => {
                        let control = Arc::new(FlowControl::new());
                        let run_id = Uuid::new_v4();
                        let (done_tx, done_rx) = watch::channel(false);
                        entries.insert(
                            flow_id,
                            ExecutorEntry {
                                run_id,
                                control: Arc::clone(&control),
                                done: done_rx,
                            },
                        );
                        let guard = DetachGuard {
                            registry: Arc::clone(self),
                            flow_id,
                            run_id,
                            done: done_tx,
                        };
                        let task = run(control);
                        tokio::spawn(async move {
                            let _guard = guard;
                            task.await;
                        });
                        tracing::debug!(%flow_id, %run_id, "executor attached");
                        return;
                    }
                }
            };
            wait_done(previous).await;
        }
    }

    fn detach(&self, flow_id: FlowId, run_id: Uuid) {
        let mut entries = self.entries();
        if entries.get(&flow_id).is_some_and(|e| e.run_id == run_id) {
            entries.remove(&flow_id);
            tracing::debug!(%flow_id, %run_id, "executor detached");
        }
    }
}

async fn wait_done(mut done: watch::Receiver<bool>) {
    // A dropped sender means the executor task is gone as well.
    let _ = done.wait_for(|finished| *finished).await;
}

/// Detaches the executor even if its task panics.
struct DetachGuard {
    registry: Arc<ExecutorRegistry>,
    flow_id: FlowId,
    run_id: Uuid,
    done: watch::Sender<bool>,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        self.registry.detach(self.flow_id, self.run_id);
        let _ = self.done.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn one_executor_per_flow() {
        let registry = Arc::new(ExecutorRegistry::new());
        let flow_id = FlowId::new_v4();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        registry
            .attach(flow_id, move |_control| async move {
                let _ = release_rx.await;
            })
            .await;
        assert!(registry.is_attached(flow_id));

        let second = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry.attach(flow_id, |_control| async {}).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        release_tx.send(()).unwrap();
        second.await.unwrap();
        registry.wait(flow_id).await;
        assert!(!registry.is_attached(flow_id));
    }

    #[test]
    fn claims_mark_a_flow_owned_until_dropped() {
        let registry = Arc::new(ExecutorRegistry::new());
        let flow_id = FlowId::new_v4();

        let first = registry.claim(flow_id);
        let second = registry.claim(flow_id);
        assert!(registry.is_owned(flow_id));
        assert!(!registry.is_attached(flow_id));

        drop(first);
        assert!(registry.is_owned(flow_id));
        drop(second);
        assert!(!registry.is_owned(flow_id));
    }

    #[test]
    fn first_pause_request_wins() {
        let control = FlowControl::new();
        control.request_pause(PauseCondition::manual("first"));
        control.request_pause(PauseCondition::manual("second"));
        assert_eq!(control.take_pause().unwrap().message.as_deref(), Some("first"));
        assert!(!control.pause_requested());
    }
}
