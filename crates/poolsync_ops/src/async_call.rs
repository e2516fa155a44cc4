//! Operations made of one or more asynchronous calls.

use crate::capability::CapabilityCheck;
use crate::context::OperationContext;
use crate::error::{OperationError, OperationResult};
use crate::operation::Operation;
use crate::progress::ProgressRange;
use async_trait::async_trait;
use poolsync_core::ObjectKey;
use poolsync_protocol::{ObjectRef, ObjectType, Value};
use std::sync::Arc;

/// Runs asynchronous calls one after another, each on its own slice of the
/// progress bar. The result is that of the last call.
pub struct AsyncCallOperation {
    title: String,
    calls: Vec<(String, Vec<Value>)>,
    checks: Vec<Arc<dyn CapabilityCheck>>,
    locks: Vec<ObjectKey>,
}

impl AsyncCallOperation {
    /// Creates an operation with no calls.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            calls: Vec::new(),
            checks: Vec::new(),
            locks: Vec::new(),
        }
    }

    /// A single asynchronous call.
    pub fn single(title: impl Into<String>, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self::new(title).call(method, params)
    }

    /// Appends a call.
    pub fn call(mut self, method: impl Into<String>, params: Vec<Value>) -> Self {
        self.calls.push((method.into(), params));
        self
    }

    /// Adds a capability check.
    pub fn check(mut self, check: impl CapabilityCheck + 'static) -> Self {
        self.checks.push(Arc::new(check));
        self
    }

    /// Holds an object busy while the operation runs.
    pub fn lock(mut self, object_type: ObjectType, reference: ObjectRef) -> Self {
        self.locks.push(ObjectKey::new(object_type, reference));
        self
    }
}

#[async_trait]
impl Operation for AsyncCallOperation {
    fn title(&self) -> String {
        self.title.clone()
    }

    fn capability_checks(&self) -> Vec<Arc<dyn CapabilityCheck>> {
        self.checks.clone()
    }

    async fn run(&self, ctx: &OperationContext) -> OperationResult<Option<Value>> {
        for key in &self.locks {
            if !ctx.lock(key.object_type.clone(), key.reference.clone()) {
                return Err(OperationError::CapabilityCheckFailed(format!(
                    "{} {} is in use",
                    key.object_type, key.reference
                )));
            }
        }

        let mut result = None;
        for (index, (method, params)) in self.calls.iter().enumerate() {
            ctx.check_cancelled()?;
            let range = ProgressRange::FULL.slice(index, self.calls.len());
            result = Some(ctx.run_task(method, params.clone(), range).await?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PoolApi;
    use crate::config::EngineConfig;
    use crate::engine::OperationEngine;
    use crate::operation::OperationState;
    use crate::testing::MockApi;
    use poolsync_protocol::Fault;

    fn engine(api: &Arc<MockApi>) -> OperationEngine {
        OperationEngine::new(Arc::clone(api) as Arc<dyn PoolApi>, EngineConfig::fast())
    }

    #[tokio::test]
    async fn two_tasks_share_the_progress_bar() {
        let api = Arc::new(MockApi::new());
        api.script_task("Async.VM.clone", vec![0.5], Ok(Value::from("OpaqueRef:clone")));
        api.script_task("Async.VM.start", vec![0.5], Ok(Value::from("started")));

        let op = AsyncCallOperation::new("clone and start")
            .call("Async.VM.clone", vec![])
            .call("Async.VM.start", vec![]);
        let done = engine(&api).submit(Box::new(op)).wait().await;

        assert_eq!(done.state, OperationState::Succeeded);
        assert_eq!(done.result, Some(Value::from("started")));
        assert_eq!(api.count("task.destroy"), 2);
    }

    #[tokio::test]
    async fn first_failure_stops_the_rest() {
        let api = Arc::new(MockApi::new());
        api.script_task("Async.a", vec![], Err(Fault::code("INTERNAL_ERROR")));
        api.script_task("Async.b", vec![], Ok(Value::Null));

        let op = AsyncCallOperation::new("a then b")
            .call("Async.a", vec![])
            .call("Async.b", vec![]);
        let done = engine(&api).submit(Box::new(op)).wait().await;

        assert_eq!(done.state, OperationState::Failed);
        assert!(matches!(done.error, Some(OperationError::TaskFailed(_))));
        assert_eq!(api.count("Async.b"), 0);
    }

    #[tokio::test]
    async fn locked_object_is_refused() {
        let api = Arc::new(MockApi::new());
        let vm = ObjectRef::new("OpaqueRef:vm");
        api.store().lock(ObjectType::Vm, vm.clone());

        let op = AsyncCallOperation::single("start", "Async.VM.start", vec![])
            .lock(ObjectType::Vm, vm);
        let done = engine(&api).submit(Box::new(op)).wait().await;
        assert!(matches!(done.error, Some(OperationError::CapabilityCheckFailed(_))));
        assert!(api.methods().is_empty());
    }
}
