//! Everything an operation can do while it runs.

use crate::api::PoolApi;
use crate::config::EngineConfig;
use crate::error::{OperationError, OperationResult};
use crate::operation::OperationHandle;
use crate::progress::ProgressRange;
use parking_lot::Mutex;
use poolsync_core::{ObjectKey, ObjectStore};
use poolsync_protocol::{
    Fault, ObjectRecord, ObjectRef, ObjectType, ProtocolError, TaskRecord, TaskStatus, Value,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Execution context handed to [`Operation::run`](crate::Operation::run).
pub struct OperationContext {
    api: Arc<dyn PoolApi>,
    handle: OperationHandle,
    config: EngineConfig,
    locks: Mutex<Vec<ObjectKey>>,
}

impl OperationContext {
    pub(crate) fn new(api: Arc<dyn PoolApi>, handle: OperationHandle, config: EngineConfig) -> Self {
        Self {
            api,
            handle,
            config,
            locks: Mutex::new(Vec::new()),
        }
    }

    /// Returns the store.
    pub fn store(&self) -> Arc<ObjectStore> {
        self.api.store()
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Issues a synchronous call.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> OperationResult<Value> {
        Ok(self.api.call(method, params).await?)
    }

    /// Starts an asynchronous call and returns its server task.
    pub async fn start_task(&self, method: &str, params: Vec<Value>) -> OperationResult<ObjectRef> {
        let value = self.call(method, params).await?;
        let task = value.as_object_ref().ok_or(ProtocolError::UnexpectedShape {
            expected: "task reference",
        })?;
        debug!(%method, %task, "task started");
        self.handle.set_task(Some(task.clone()));
        Ok(task)
    }

    /// Polls `task` until it finishes, mapping its progress onto `range`.
    ///
    /// Cancellation is checked on every poll. When it is requested the server
    /// task is asked to cancel too; that request is best-effort and its
    /// failure does not change the outcome. Finished tasks are destroyed.
    pub async fn wait_for_task(&self, task: &ObjectRef, range: ProgressRange) -> OperationResult<Value> {
        self.poll_task(task, range, true).await
    }

    /// Starts an asynchronous call and waits for its task.
    pub async fn run_task(
        &self,
        method: &str,
        params: Vec<Value>,
        range: ProgressRange,
    ) -> OperationResult<Value> {
        let task = self.start_task(method, params).await?;
        self.wait_for_task(&task, range).await
    }

    /// Like [`run_task`](Self::run_task) but ignores cancellation and leaves
    /// progress alone. Used for compensation.
    pub(crate) async fn run_task_to_completion(&self, method: &str, params: Vec<Value>) -> OperationResult<Value> {
        let task = self.start_task(method, params).await?;
        let here = self.percent();
        self.poll_task(&task, ProgressRange::new(here, here), false).await
    }

    async fn poll_task(&self, task: &ObjectRef, range: ProgressRange, cancellable: bool) -> OperationResult<Value> {
        let outcome = loop {
            if cancellable && self.is_cancel_requested() {
                if let Err(error) = self.call("task.cancel", vec![Value::from(task)]).await {
                    warn!(%task, %error, "server-side task cancel failed");
                }
                break Err(OperationError::Cancelled);
            }

            let record = match self.read_task(task).await {
                Ok(record) => record,
                Err(error) => break Err(error),
            };
            self.set_percent(range.map(record.percent()));

            match record.status {
                TaskStatus::Success => {
                    self.set_percent(range.end());
                    break Ok(record.result.unwrap_or(Value::Null));
                }
                TaskStatus::Failure => {
                    let fault = record
                        .error
                        .unwrap_or_else(|| Fault::code("INTERNAL_ERROR"));
                    break Err(OperationError::TaskFailed(fault));
                }
                TaskStatus::Cancelled => break Err(OperationError::Cancelled),
                TaskStatus::Pending | TaskStatus::Cancelling => {}
            }
            sleep(self.config.task_poll_interval).await;
        };

        self.handle.set_task(None);
        if let Err(error) = self.call("task.destroy", vec![Value::from(task)]).await {
            debug!(%task, %error, "task destroy failed");
        }
        outcome
    }

    async fn read_task(&self, task: &ObjectRef) -> OperationResult<TaskRecord> {
        let record = self.call("task.get_record", vec![Value::from(task)]).await?;
        Ok(TaskRecord::from_value(&record)?)
    }

    /// Raises percent complete. Lower values are ignored.
    pub fn set_percent(&self, percent: f64) {
        self.handle.raise_percent(percent);
    }

    /// Returns percent complete.
    pub fn percent(&self) -> f64 {
        self.handle.percent()
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.handle.is_cancel_requested()
    }

    /// Returns `Err(Cancelled)` once cancellation was requested.
    pub fn check_cancelled(&self) -> OperationResult<()> {
        if self.is_cancel_requested() {
            Err(OperationError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Marks an object busy for the rest of the operation.
    ///
    /// Returns false if someone else holds it. Held objects are released when
    /// the operation ends, whatever the outcome.
    pub fn lock(&self, object_type: ObjectType, reference: ObjectRef) -> bool {
        let key = ObjectKey::new(object_type, reference);
        if !self.store().lock(key.object_type.clone(), key.reference.clone()) {
            return false;
        }
        self.locks.lock().push(key);
        true
    }

    pub(crate) fn release_locks(&self) {
        let store = self.store();
        for key in self.locks.lock().drain(..) {
            store.unlock(&key.object_type, &key.reference);
        }
    }

    /// Waits up to `timeout` for an object to appear in the store.
    ///
    /// Only the store is watched; the synchronizer is what brings the object
    /// in.
    pub async fn wait_for_object(
        &self,
        object_type: &ObjectType,
        reference: &ObjectRef,
        timeout: Duration,
    ) -> OperationResult<ObjectRecord> {
        let found = self
            .wait_until(timeout, |store| store.get(object_type, reference))
            .await;
        found.ok_or_else(|| OperationError::Timeout(format!("{object_type} {reference} never appeared")))
    }

    /// Waits up to `timeout` for `probe` to return something, checking the
    /// store every object poll interval.
    pub async fn wait_until<T, F>(&self, timeout: Duration, probe: F) -> Option<T>
    where
        F: Fn(&ObjectStore) -> Option<T>,
    {
        let store = self.store();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(found) = probe(&store) {
                return Some(found);
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(self.config.object_poll_interval).await;
        }
    }
}

impl Drop for OperationContext {
    fn drop(&mut self) {
        self.release_locks();
    }
}
