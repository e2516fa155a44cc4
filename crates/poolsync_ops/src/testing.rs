//! In-crate test double for [`PoolApi`].

use crate::api::PoolApi;
use async_trait::async_trait;
use parking_lot::Mutex;
use poolsync_core::ObjectStore;
use poolsync_engine::{EngineError, EngineResult};
use poolsync_protocol::{Fault, ObjectRecord, ObjectRef, ObjectType, TaskStatus, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

struct ScriptedTask {
    progress: VecDeque<f64>,
    outcome: Result<Value, Fault>,
    cancel_requested: bool,
}

#[derive(Default)]
struct MockState {
    calls: Vec<(String, Vec<Value>)>,
    faults: HashMap<String, Fault>,
    scripts: HashMap<String, (Vec<f64>, Result<Value, Fault>)>,
    tasks: HashMap<ObjectRef, ScriptedTask>,
    next: u64,
}

/// Records every call. Methods fail if told to, start scripted tasks if
/// scripted, and otherwise return a fresh reference.
pub(crate) struct MockApi {
    store: Arc<ObjectStore>,
    state: Mutex<MockState>,
}

impl MockApi {
    pub(crate) fn new() -> Self {
        Self {
            store: Arc::new(ObjectStore::new()),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Makes every call to `method` fail with `fault`.
    pub(crate) fn fail(&self, method: &str, fault: Fault) {
        self.state.lock().faults.insert(method.to_string(), fault);
    }

    /// Makes `method` start a task reporting `progress` fractions, then `outcome`.
    pub(crate) fn script_task(&self, method: &str, progress: Vec<f64>, outcome: Result<Value, Fault>) {
        self.state
            .lock()
            .scripts
            .insert(method.to_string(), (progress, outcome));
    }

    pub(crate) fn count(&self, method: &str) -> usize {
        self.state.lock().calls.iter().filter(|(m, _)| m == method).count()
    }

    pub(crate) fn methods(&self) -> Vec<String> {
        self.state.lock().calls.iter().map(|(m, _)| m.clone()).collect()
    }

    fn task_record(status: TaskStatus, progress: f64, result: Value, error: Option<&Fault>) -> Value {
        ObjectRecord::new(ObjectType::Task)
            .field("status", status.wire_name())
            .field("progress", progress)
            .field("result", result)
            .field(
                "error_info",
                error.map(Fault::to_value).unwrap_or(Value::Array(Vec::new())),
            )
            .to_value()
    }
}

#[async_trait]
impl PoolApi for MockApi {
    async fn call(&self, method: &str, params: Vec<Value>) -> EngineResult<Value> {
        let mut state = self.state.lock();
        state.calls.push((method.to_string(), params.clone()));
        if let Some(fault) = state.faults.get(method) {
            return Err(EngineError::Server(fault.clone()));
        }
        let task = params.first().and_then(Value::as_object_ref);

        match method {
            "task.get_record" => {
                let Some(entry) = task.as_ref().and_then(|t| state.tasks.get_mut(t)) else {
                    return Err(EngineError::Server(Fault::code(Fault::HANDLE_INVALID)));
                };
                if entry.cancel_requested {
                    return Ok(Self::task_record(TaskStatus::Cancelled, 0.0, Value::Null, None));
                }
                if let Some(progress) = entry.progress.pop_front() {
                    return Ok(Self::task_record(TaskStatus::Pending, progress, Value::Null, None));
                }
                Ok(match &entry.outcome {
                    Ok(value) => Self::task_record(TaskStatus::Success, 1.0, value.clone(), None),
                    Err(fault) => Self::task_record(TaskStatus::Failure, 1.0, Value::Null, Some(fault)),
                })
            }
            "task.cancel" => {
                if let Some(entry) = task.as_ref().and_then(|t| state.tasks.get_mut(t)) {
                    entry.cancel_requested = true;
                }
                Ok(Value::Null)
            }
            "task.destroy" => {
                if let Some(t) = task {
                    state.tasks.remove(&t);
                }
                Ok(Value::Null)
            }
            _ => {
                state.next += 1;
                let n = state.next;
                if let Some((progress, outcome)) = state.scripts.get(method).cloned() {
                    let reference = ObjectRef::new(format!("OpaqueRef:task-{n}"));
                    state.tasks.insert(
                        reference.clone(),
                        ScriptedTask {
                            progress: progress.into(),
                            outcome,
                            cancel_requested: false,
                        },
                    );
                    return Ok(Value::Ref(reference));
                }
                Ok(Value::Ref(ObjectRef::new(format!("OpaqueRef:{method}-{n}"))))
            }
        }
    }

    fn store(&self) -> Arc<ObjectStore> {
        Arc::clone(&self.store)
    }
}
