//! Multi-step operations that undo completed steps on failure.
//!
//! Steps run in order. Each step that completes leaves behind a
//! [`Compensation`]; if a later step fails, or the operation is cancelled
//! between steps, the compensations of completed steps run newest first. A
//! step that fails is expected to leave nothing behind, so it has nothing to
//! undo. Rollback never fails: errors are logged and the next compensation
//! runs anyway. The error returned is always the one that stopped the
//! forward run.

use crate::capability::CapabilityCheck;
use crate::context::OperationContext;
use crate::error::OperationResult;
use crate::operation::Operation;
use crate::progress::ProgressRange;
use async_trait::async_trait;
use poolsync_protocol::{ObjectRef, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How to undo a completed step.
#[derive(Debug, Clone, PartialEq)]
pub enum Compensation {
    /// A synchronous call.
    Call {
        /// Method name.
        method: String,
        /// Parameters, session excluded.
        params: Vec<Value>,
    },
    /// An asynchronous call whose task is waited for.
    AsyncCall {
        /// Method name.
        method: String,
        /// Parameters, session excluded.
        params: Vec<Value>,
    },
    /// Nothing to undo.
    None,
}

impl Compensation {
    /// A synchronous undo call.
    pub fn call(method: impl Into<String>, params: Vec<Value>) -> Self {
        Compensation::Call {
            method: method.into(),
            params,
        }
    }

    /// An asynchronous undo call.
    pub fn async_call(method: impl Into<String>, params: Vec<Value>) -> Self {
        Compensation::AsyncCall {
            method: method.into(),
            params,
        }
    }
}

/// What a completed step leaves behind.
#[derive(Debug, Clone, PartialEq)]
pub struct Completed {
    /// The object the step created, if any.
    pub created: Option<ObjectRef>,
    /// How to undo the step.
    pub undo: Compensation,
}

impl Completed {
    /// A step that created `created`.
    pub fn created(created: ObjectRef, undo: Compensation) -> Self {
        Self {
            created: Some(created),
            undo,
        }
    }

    /// A step that created nothing.
    pub fn done(undo: Compensation) -> Self {
        Self { created: None, undo }
    }
}

/// One step of a composite operation.
#[async_trait]
pub trait Step: Send + Sync {
    /// Short description for logs.
    fn describe(&self) -> String;

    /// Runs the step.
    ///
    /// `earlier` holds what the steps before this one completed, in order.
    /// Progress reported by the step should stay inside `range`.
    async fn execute(
        &self,
        ctx: &OperationContext,
        range: ProgressRange,
        earlier: &[Completed],
    ) -> OperationResult<Completed>;
}

/// Runs `steps` in order, rolling back on failure or cancellation.
///
/// Each step gets an equal slice of `range`.
pub async fn run_steps(
    ctx: &OperationContext,
    steps: &[Box<dyn Step>],
    range: ProgressRange,
) -> OperationResult<Vec<Completed>> {
    let mut completed: Vec<Completed> = Vec::with_capacity(steps.len());
    for (index, step) in steps.iter().enumerate() {
        let slice = range.slice(index, steps.len());
        let outcome = match ctx.check_cancelled() {
            Ok(()) => step.execute(ctx, slice, &completed).await,
            Err(cancelled) => Err(cancelled),
        };
        match outcome {
            Ok(done) => {
                debug!(step = %step.describe(), "step completed");
                ctx.set_percent(slice.end());
                completed.push(done);
            }
            Err(error) => {
                warn!(step = %step.describe(), %error, "step failed; rolling back");
                let undone = roll_back(ctx, &completed).await;
                info!(undone, "rollback finished");
                return Err(error);
            }
        }
    }
    Ok(completed)
}

/// Runs the compensations of `completed`, newest first.
///
/// Returns how many compensation actions were attempted.
pub async fn roll_back(ctx: &OperationContext, completed: &[Completed]) -> usize {
    let mut attempted = 0;
    for done in completed.iter().rev() {
        let result = match &done.undo {
            Compensation::None => continue,
            Compensation::Call { method, params } => ctx.call(method, params.clone()).await,
            Compensation::AsyncCall { method, params } => {
                ctx.run_task_to_completion(method, params.clone()).await
            }
        };
        attempted += 1;
        if let Err(error) = result {
            warn!(undo = ?done.undo, %error, "compensation failed; continuing");
        }
    }
    attempted
}

/// A composite operation built from a list of steps.
///
/// The result is the object created by the last step that created one.
pub struct CompositeOperation {
    title: String,
    steps: Vec<Box<dyn Step>>,
    checks: Vec<Arc<dyn CapabilityCheck>>,
}

impl CompositeOperation {
    /// Creates an operation with no steps.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            steps: Vec::new(),
            checks: Vec::new(),
        }
    }

    /// Appends a step.
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Adds a capability check.
    pub fn check(mut self, check: impl CapabilityCheck + 'static) -> Self {
        self.checks.push(Arc::new(check));
        self
    }

    /// Returns the number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if there are no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[async_trait]
impl Operation for CompositeOperation {
    fn title(&self) -> String {
        self.title.clone()
    }

    fn capability_checks(&self) -> Vec<Arc<dyn CapabilityCheck>> {
        self.checks.clone()
    }

    async fn run(&self, ctx: &OperationContext) -> OperationResult<Option<Value>> {
        let completed = run_steps(ctx, &self.steps, ProgressRange::FULL).await?;
        Ok(completed
            .iter()
            .rev()
            .find_map(|c| c.created.clone())
            .map(Value::Ref))
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
    use proptest::prelude::*;

    /// Creates something on one host via `create.<name>`; undone by `undo.<name>`.
    struct Create {
        name: String,
    }

    #[async_trait]
    impl Step for Create {
        fn describe(&self) -> String {
            format!("create on {}", self.name)
        }

        async fn execute(
            &self,
            ctx: &OperationContext,
            _range: ProgressRange,
            _earlier: &[Completed],
        ) -> OperationResult<Completed> {
            let created = ctx.call(&format!("create.{}", self.name), vec![]).await?;
            let created = created.as_object_ref().unwrap_or_else(ObjectRef::null);
            Ok(Completed::created(
                created.clone(),
                Compensation::call(format!("undo.{}", self.name), vec![Value::from(created)]),
            ))
        }
    }

    fn composite(hosts: &[&str]) -> CompositeOperation {
        hosts.iter().fold(CompositeOperation::new("create everywhere"), |op, h| {
            op.step(Create { name: h.to_string() })
        })
    }

    fn engine(api: &Arc<MockApi>) -> OperationEngine {
        OperationEngine::new(Arc::clone(api) as Arc<dyn PoolApi>, EngineConfig::fast())
    }

    #[tokio::test]
    async fn failure_on_b_undoes_a_and_never_touches_c() {
        let api = Arc::new(MockApi::new());
        api.fail("create.b", Fault::code("INTERNAL_ERROR"));

        let done = engine(&api).submit(Box::new(composite(&["a", "b", "c"]))).wait().await;

        assert_eq!(done.state, OperationState::Failed);
        assert_eq!(
            done.error.and_then(|e| e.fault().cloned()).map(|f| f.code),
            Some("INTERNAL_ERROR".to_string())
        );
        assert_eq!(api.methods(), vec!["create.a", "create.b", "undo.a"]);
    }

    #[tokio::test]
    async fn rollback_failures_do_not_replace_the_error() {
        let api = Arc::new(MockApi::new());
        api.fail("create.c", Fault::code("HOST_OFFLINE"));
        api.fail("undo.a", Fault::code("UNDO_BROKEN"));
        api.fail("undo.b", Fault::code("UNDO_BROKEN"));

        let done = engine(&api).submit(Box::new(composite(&["a", "b", "c"]))).wait().await;

        assert_eq!(
            done.error.and_then(|e| e.fault().cloned()).map(|f| f.code),
            Some("HOST_OFFLINE".to_string())
        );
        assert_eq!(api.count("undo.a") + api.count("undo.b"), 2);
        assert_eq!(api.methods().last().map(String::as_str), Some("undo.a"));
    }

    #[tokio::test]
    async fn cancel_before_start_does_nothing() {
        let api = Arc::new(MockApi::new());
        let handle = engine(&api).submit(Box::new(composite(&["a", "b"])));
        handle.cancel();
        let done = handle.wait().await;
        assert_eq!(done.state, OperationState::Cancelled);
        assert!(api.methods().is_empty());
    }

    #[tokio::test]
    async fn success_returns_the_last_created_object() {
        let api = Arc::new(MockApi::new());
        let done = engine(&api).submit(Box::new(composite(&["a", "b"]))).wait().await;
        assert_eq!(done.state, OperationState::Succeeded);
        assert_eq!(done.result, Some(Value::Ref(ObjectRef::new("OpaqueRef:create.b-2"))));
        assert_eq!(api.count("undo.a") + api.count("undo.b"), 0);
    }

    #[tokio::test]
    async fn async_compensation_waits_for_its_task() {
        struct Started;

        #[async_trait]
        impl Step for Started {
            fn describe(&self) -> String {
                "started".into()
            }

            async fn execute(
                &self,
                _ctx: &OperationContext,
                _range: ProgressRange,
                _earlier: &[Completed],
            ) -> OperationResult<Completed> {
                Ok(Completed::done(Compensation::async_call("Async.undo", vec![])))
            }
        }

        let api = Arc::new(MockApi::new());
        api.script_task("Async.undo", vec![0.5], Ok(Value::Null));
        api.fail("create.x", Fault::code("INTERNAL_ERROR"));
        let op = CompositeOperation::new("t")
            .step(Started)
            .step(Create { name: "x".into() });

        let done = engine(&api).submit(Box::new(op)).wait().await;
        assert_eq!(done.state, OperationState::Failed);
        assert_eq!(api.count("Async.undo"), 1);
        assert_eq!(api.count("task.get_record"), 2);
        assert_eq!(api.count("task.destroy"), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn failing_step_n_undoes_n_minus_one(steps in 1usize..8, fail_at in 1usize..8) {
            prop_assume!(fail_at <= steps);
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let names: Vec<String> = (0..steps).map(|i| format!("h{i}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();

            let api = Arc::new(MockApi::new());
            api.fail(&format!("create.{}", names[fail_at - 1]), Fault::code("INTERNAL_ERROR"));
            for name in &names {
                api.fail(&format!("undo.{name}"), Fault::code("UNDO_BROKEN"));
            }

            let done = runtime.block_on(async {
                engine(&api).submit(Box::new(composite(&refs))).wait().await
            });

            let undos = api.methods().iter().filter(|m| m.starts_with("undo.")).count();
            prop_assert_eq!(undos, fail_at - 1);
            let creates = api.methods().iter().filter(|m| m.starts_with("create.")).count();
            prop_assert_eq!(creates, fail_at);
            prop_assert_eq!(done.state, OperationState::Failed);
            prop_assert_eq!(
                done.error.and_then(|e| e.fault().cloned()).map(|f| f.code),
                Some("INTERNAL_ERROR".to_string())
            );
        }
    }
}
