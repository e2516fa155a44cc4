//! Operations, their lifecycle and the handles callers observe them through.

use crate::capability::CapabilityCheck;
use crate::context::OperationContext;
use crate::error::{OperationError, OperationResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use poolsync_protocol::{ObjectRef, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use uuid::Uuid;

/// Lifecycle state of an operation.
///
/// Transitions only go forward: `Created -> Running -> {Succeeded, Failed,
/// Cancelled}`, or straight from `Created` to a terminal state when a
/// capability check fails or the operation is cancelled before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    /// Submitted, not yet started.
    Created,
    /// Running.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Cancelled.
    Cancelled,
}

impl OperationState {
    /// Returns true for the three end states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Succeeded | OperationState::Failed | OperationState::Cancelled
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationState::Created => "created",
            OperationState::Running => "running",
            OperationState::Succeeded => "succeeded",
            OperationState::Failed => "failed",
            OperationState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Point-in-time copy of an operation's observable state.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSnapshot {
    /// Operation id.
    pub id: Uuid,
    /// Title.
    pub title: String,
    /// Description.
    pub description: String,
    /// Lifecycle state.
    pub state: OperationState,
    /// Percent complete, 0-100, never decreasing.
    pub percent: f64,
    /// Server task currently being waited on.
    pub task: Option<ObjectRef>,
    /// Result, once succeeded.
    pub result: Option<Value>,
    /// Error, once failed.
    pub error: Option<OperationError>,
}

impl OperationSnapshot {
    /// Percent complete rounded down to an integer.
    pub fn whole_percent(&self) -> u8 {
        self.percent.clamp(0.0, 100.0) as u8
    }
}

/// Work that runs against a pool.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Short title.
    fn title(&self) -> String;

    /// Longer description; defaults to the title.
    fn description(&self) -> String {
        self.title()
    }

    /// Checks evaluated before the operation starts.
    fn capability_checks(&self) -> Vec<Arc<dyn CapabilityCheck>> {
        Vec::new()
    }

    /// Does the work.
    async fn run(&self, ctx: &OperationContext) -> OperationResult<Option<Value>>;
}

type TerminalCallback = Box<dyn FnOnce(&OperationSnapshot) + Send>;

struct Status {
    snapshot: OperationSnapshot,
    callbacks: Vec<TerminalCallback>,
}

struct Shared {
    status: Mutex<Status>,
    cancel_requested: AtomicBool,
    state_tx: watch::Sender<OperationState>,
}

/// Handle to a submitted operation.
///
/// Cloning is cheap. Only the engine's execution task mutates the state;
/// handles read it and may request cancellation.
#[derive(Clone)]
pub struct OperationHandle {
    shared: Arc<Shared>,
}

impl OperationHandle {
    pub(crate) fn new(title: String, description: String) -> Self {
        let (state_tx, _) = watch::channel(OperationState::Created);
        Self {
            shared: Arc::new(Shared {
                status: Mutex::new(Status {
                    snapshot: OperationSnapshot {
                        id: Uuid::new_v4(),
                        title,
                        description,
                        state: OperationState::Created,
                        percent: 0.0,
                        task: None,
                        result: None,
                        error: None,
                    },
                    callbacks: Vec::new(),
                }),
                cancel_requested: AtomicBool::new(false),
                state_tx,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakOperationHandle {
        WeakOperationHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Returns the operation id.
    pub fn id(&self) -> Uuid {
        self.shared.status.lock().snapshot.id
    }

    /// Returns the title.
    pub fn title(&self) -> String {
        self.shared.status.lock().snapshot.title.clone()
    }

    /// Returns the description.
    pub fn description(&self) -> String {
        self.shared.status.lock().snapshot.description.clone()
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> OperationState {
        self.shared.status.lock().snapshot.state
    }

    /// Returns percent complete.
    pub fn percent(&self) -> f64 {
        self.shared.status.lock().snapshot.percent
    }

    /// Returns the result of a succeeded operation.
    pub fn result(&self) -> Option<Value> {
        self.shared.status.lock().snapshot.result.clone()
    }

    /// Returns the error of a failed operation.
    pub fn error(&self) -> Option<OperationError> {
        self.shared.status.lock().snapshot.error.clone()
    }

    /// Returns a copy of the observable state.
    pub fn snapshot(&self) -> OperationSnapshot {
        self.shared.status.lock().snapshot.clone()
    }

    /// Requests cancellation.
    ///
    /// Takes effect at the operation's next cancellation point; an operation
    /// that has not started yet never starts.
    pub fn cancel(&self) {
        self.shared.cancel_requested.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.shared.cancel_requested.load(Ordering::SeqCst)
    }

    /// Registers a callback run exactly once when the operation ends.
    ///
    /// Runs immediately if the operation has already ended.
    pub fn on_terminal<F>(&self, callback: F)
    where
        F: FnOnce(&OperationSnapshot) + Send + 'static,
    {
        let mut status = self.shared.status.lock();
        if status.snapshot.state.is_terminal() {
            let snapshot = status.snapshot.clone();
            drop(status);
            callback(&snapshot);
        } else {
            status.callbacks.push(Box::new(callback));
        }
    }

    /// Waits for the operation to end and returns its final state.
    pub async fn wait(&self) -> OperationSnapshot {
        let mut rx = self.shared.state_tx.subscribe();
        // The sender lives in `self`, so this only ends with a terminal state.
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        self.snapshot()
    }

    pub(crate) fn set_running(&self) {
        self.shared.status.lock().snapshot.state = OperationState::Running;
        self.shared.state_tx.send_replace(OperationState::Running);
    }

    pub(crate) fn raise_percent(&self, percent: f64) -> f64 {
        let mut status = self.shared.status.lock();
        let percent = percent.clamp(0.0, 100.0);
        if percent > status.snapshot.percent {
            status.snapshot.percent = percent;
        }
        status.snapshot.percent
    }

    pub(crate) fn set_task(&self, task: Option<ObjectRef>) {
        self.shared.status.lock().snapshot.task = task;
    }

    /// Moves to a terminal state and fires the callbacks. Later calls are ignored.
    pub(crate) fn finish(&self, outcome: Result<Option<Value>, OperationError>) {
        let (snapshot, callbacks) = {
            let mut status = self.shared.status.lock();
            if status.snapshot.state.is_terminal() {
                return;
            }
            let snapshot = &mut status.snapshot;
            snapshot.task = None;
            match outcome {
                Ok(result) => {
                    snapshot.state = OperationState::Succeeded;
                    snapshot.percent = 100.0;
                    snapshot.result = result;
                }
                Err(OperationError::Cancelled) => snapshot.state = OperationState::Cancelled,
                Err(error) => {
                    snapshot.state = OperationState::Failed;
                    snapshot.error = Some(error);
                }
            }
            (status.snapshot.clone(), std::mem::take(&mut status.callbacks))
        };
        self.shared.state_tx.send_replace(snapshot.state);
        for callback in callbacks {
            callback(&snapshot);
        }
    }
}

/// Non-owning reference kept by the engine.
#[derive(Clone)]
pub(crate) struct WeakOperationHandle {
    shared: Weak<Shared>,
}

impl WeakOperationHandle {
    pub(crate) fn upgrade(&self) -> Option<OperationHandle> {
        self.shared.upgrade().map(|shared| OperationHandle { shared })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.shared.strong_count() > 0
    }
}

impl fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("OperationHandle")
            .field("id", &snapshot.id)
            .field("title", &snapshot.title)
            .field("state", &snapshot.state)
            .field("percent", &snapshot.percent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn handle() -> OperationHandle {
        OperationHandle::new("t".into(), "test".into())
    }

    #[test]
    fn percent_never_decreases() {
        let h = handle();
        assert_eq!(h.raise_percent(40.0), 40.0);
        assert_eq!(h.raise_percent(10.0), 40.0);
        assert_eq!(h.raise_percent(250.0), 100.0);
    }

    #[test]
    fn terminal_callback_fires_once() {
        let h = handle();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        h.on_terminal(move |s| {
            assert_eq!(s.state, OperationState::Failed);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        h.finish(Err(OperationError::Planning("x".into())));
        h.finish(Ok(None));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(h.state(), OperationState::Failed);
    }

    #[test]
    fn late_callback_runs_immediately() {
        let h = handle();
        h.finish(Ok(Some(Value::from("done"))));
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        h.on_terminal(move |s| {
            assert_eq!(s.result, Some(Value::from("done")));
            flag.store(true, Ordering::SeqCst);
        });
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(h.percent(), 100.0);
    }

    #[test]
    fn cancelled_error_ends_cancelled() {
        let h = handle();
        h.finish(Err(OperationError::Cancelled));
        assert_eq!(h.state(), OperationState::Cancelled);
        assert!(h.error().is_none());
    }

    #[tokio::test]
    async fn wait_returns_terminal_snapshot() {
        let h = handle();
        let waiter = h.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        h.set_running();
        h.finish(Ok(None));
        let snapshot = task.await.unwrap();
        assert_eq!(snapshot.state, OperationState::Succeeded);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(handle().id(), handle().id());
    }
}
