//! Runs operations in the background.

use crate::api::PoolApi;
use crate::config::EngineConfig;
use crate::context::OperationContext;
use crate::error::OperationError;
use crate::operation::{Operation, OperationHandle, WeakOperationHandle};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Submits operations and tracks the ones still in use.
///
/// The engine holds operations weakly. One that has ended is freed as soon
/// as every caller has dropped its handle.
pub struct OperationEngine {
    api: Arc<dyn PoolApi>,
    config: EngineConfig,
    history: Mutex<Vec<WeakOperationHandle>>,
}

impl OperationEngine {
    /// Creates an engine issuing calls through `api`.
    pub fn new(api: Arc<dyn PoolApi>, config: EngineConfig) -> Self {
        Self {
            api,
            config,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts `operation` on the runtime and returns its handle.
    ///
    /// Capability checks run first; if one fails the operation ends
    /// `Failed` without any call having been made.
    pub fn submit(&self, operation: Box<dyn Operation>) -> OperationHandle {
        let handle = OperationHandle::new(operation.title(), operation.description());
        {
            let mut history = self.history.lock();
            history.retain(WeakOperationHandle::is_alive);
            history.push(handle.downgrade());
        }
        debug!(id = %handle.id(), title = %handle.title(), "operation submitted");

        let api = Arc::clone(&self.api);
        let config = self.config.clone();
        let running = handle.clone();
        tokio::spawn(async move { execute(api, config, operation, running).await });
        handle
    }

    /// Returns the handle of an operation that is still in use.
    pub fn get(&self, id: Uuid) -> Option<OperationHandle> {
        self.operations().into_iter().find(|h| h.id() == id)
    }

    /// Returns every operation still in use, oldest first.
    pub fn operations(&self) -> Vec<OperationHandle> {
        self.history
            .lock()
            .iter()
            .filter_map(WeakOperationHandle::upgrade)
            .collect()
    }

    /// Returns the operations that have not ended.
    pub fn active(&self) -> Vec<OperationHandle> {
        self.operations()
            .into_iter()
            .filter(|h| !h.state().is_terminal())
            .collect()
    }

    /// Forgets ended operations, even if callers still hold their handles.
    /// Returns how many entries were dropped.
    pub fn prune_finished(&self) -> usize {
        let mut history = self.history.lock();
        let before = history.len();
        history.retain(|w| w.upgrade().is_some_and(|h| !h.state().is_terminal()));
        before - history.len()
    }

    /// Requests cancellation of every active operation.
    pub fn cancel_all(&self) {
        for handle in self.active() {
            handle.cancel();
        }
    }
}

async fn execute(
    api: Arc<dyn PoolApi>,
    config: EngineConfig,
    operation: Box<dyn Operation>,
    handle: OperationHandle,
) {
    let id = handle.id();
    let store = api.store();
    for check in operation.capability_checks() {
        if let Err(reason) = check.check(&store) {
            warn!(%id, check = %check.describe(), %reason, "capability check failed");
            handle.finish(Err(OperationError::CapabilityCheckFailed(reason)));
            return;
        }
    }
    if handle.is_cancel_requested() {
        debug!(%id, "cancelled before start");
        handle.finish(Err(OperationError::Cancelled));
        return;
    }

    handle.set_running();
    info!(%id, title = %handle.title(), "operation started");
    let ctx = Arc::new(OperationContext::new(api, handle.clone(), config));
    let body = Arc::clone(&ctx);
    // A panic in the body still ends the operation and releases its locks.
    let joined = tokio::spawn(async move { operation.run(&body).await }).await;
    ctx.release_locks();

    let outcome = match joined {
        Ok(outcome) => outcome,
        Err(error) if error.is_panic() => {
            Err(OperationError::Panicked(panic_message(error.into_panic())))
        }
        Err(_) => Err(OperationError::Cancelled),
    };

    match &outcome {
        Ok(_) => info!(%id, "operation succeeded"),
        Err(OperationError::Cancelled) => info!(%id, "operation cancelled"),
        Err(error) => warn!(%id, %error, "operation failed"),
    }
    handle.finish(outcome);
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityCheck, ObjectsNotLocked};
    use crate::error::OperationResult;
    use crate::operation::OperationState;
    use crate::testing::MockApi;
    use async_trait::async_trait;
    use poolsync_protocol::{ObjectRef, ObjectType, Value};

    struct Echo {
        locked: Option<ObjectRef>,
    }

    #[async_trait]
    impl Operation for Echo {
        fn title(&self) -> String {
            "echo".into()
        }

        fn capability_checks(&self) -> Vec<Arc<dyn CapabilityCheck>> {
            match &self.locked {
                Some(r) => vec![Arc::new(ObjectsNotLocked::new().with(ObjectType::Vm, r.clone()))],
                None => Vec::new(),
            }
        }

        async fn run(&self, ctx: &OperationContext) -> OperationResult<Option<Value>> {
            if let Some(r) = &self.locked {
                ctx.lock(ObjectType::Vm, r.clone());
            }
            ctx.call("VM.echo", vec![]).await.map(Some)
        }
    }

    fn engine(api: &Arc<MockApi>) -> OperationEngine {
        OperationEngine::new(Arc::clone(api) as Arc<dyn PoolApi>, EngineConfig::fast())
    }

    #[tokio::test]
    async fn runs_to_success() {
        let api = Arc::new(MockApi::new());
        let engine = engine(&api);
        let handle = engine.submit(Box::new(Echo { locked: None }));
        let done = handle.wait().await;
        assert_eq!(done.state, OperationState::Succeeded);
        assert_eq!(done.percent, 100.0);
        assert!(done.result.is_some());
        assert_eq!(engine.get(handle.id()).map(|h| h.id()), Some(handle.id()));
    }

    #[tokio::test]
    async fn failed_check_means_no_calls() {
        let api = Arc::new(MockApi::new());
        let vm = ObjectRef::new("OpaqueRef:vm");
        api.store().lock(ObjectType::Vm, vm.clone());

        let done = engine(&api).submit(Box::new(Echo { locked: Some(vm) })).wait().await;
        assert_eq!(done.state, OperationState::Failed);
        assert!(matches!(done.error, Some(OperationError::CapabilityCheckFailed(_))));
        assert!(api.methods().is_empty());
    }

    #[tokio::test]
    async fn locks_released_at_the_end() {
        let api = Arc::new(MockApi::new());
        let vm = ObjectRef::new("OpaqueRef:vm");
        let done = engine(&api)
            .submit(Box::new(Echo { locked: Some(vm.clone()) }))
            .wait()
            .await;
        assert_eq!(done.state, OperationState::Succeeded);
        assert!(!api.store().is_locked(&ObjectType::Vm, &vm));
    }

    #[tokio::test]
    async fn server_error_fails_the_operation() {
        let api = Arc::new(MockApi::new());
        api.fail("VM.echo", poolsync_protocol::Fault::code("VM_IS_TEMPLATE"));
        let engine = engine(&api);
        let handle = engine.submit(Box::new(Echo { locked: None }));
        let done = handle.wait().await;
        assert_eq!(done.state, OperationState::Failed);
        assert_eq!(done.error.and_then(|e| e.fault().cloned()).map(|f| f.code), Some("VM_IS_TEMPLATE".into()));
        assert_eq!(engine.prune_finished(), 1);
        assert!(engine.operations().is_empty());
    }

    struct Explodes {
        vm: ObjectRef,
    }

    #[async_trait]
    impl Operation for Explodes {
        fn title(&self) -> String {
            "explodes".into()
        }

        async fn run(&self, ctx: &OperationContext) -> OperationResult<Option<Value>> {
            ctx.lock(ObjectType::Vm, self.vm.clone());
            let nothing: Vec<Value> = Vec::new();
            Ok(Some(nothing[0].clone()))
        }
    }

    #[tokio::test]
    async fn panicking_operation_fails_and_releases_locks() {
        let api = Arc::new(MockApi::new());
        let vm = ObjectRef::new("OpaqueRef:vm");
        let handle = engine(&api).submit(Box::new(Explodes { vm: vm.clone() }));

        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        handle.on_terminal(move |_| flag.store(true, std::sync::atomic::Ordering::SeqCst));

        let done = tokio::time::timeout(std::time::Duration::from_secs(2), handle.wait())
            .await
            .expect("operation never ended");
        assert_eq!(done.state, OperationState::Failed);
        assert!(matches!(done.error, Some(OperationError::Panicked(_))));
        assert!(!api.store().is_locked(&ObjectType::Vm, &vm));
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn released_operations_are_forgotten() {
        let api = Arc::new(MockApi::new());
        let engine = engine(&api);
        for _ in 0..100 {
            let handle = engine.submit(Box::new(Echo { locked: None }));
            assert_eq!(handle.wait().await.state, OperationState::Succeeded);
        }

        // The execution task drops its handle just after finishing.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while !engine.operations().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(engine.operations().is_empty());

        let kept = engine.submit(Box::new(Echo { locked: None }));
        assert_eq!(engine.history.lock().len(), 1);
        kept.wait().await;
        assert_eq!(engine.get(kept.id()).map(|h| h.id()), Some(kept.id()));
    }
}
