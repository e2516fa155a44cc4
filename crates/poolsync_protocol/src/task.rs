//! Server-side task records.

use crate::error::{ProtocolError, ProtocolResult};
use crate::fault::Fault;
use crate::record::ObjectRecord;
use crate::reference::ObjectType;
use crate::value::Value;

/// Lifecycle of a server-side task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Queued or running.
    Pending,
    /// Finished; the result is available.
    Success,
    /// Finished with an error.
    Failure,
    /// A cancel was requested and is in progress.
    Cancelling,
    /// Cancelled.
    Cancelled,
}

impl TaskStatus {
    /// Parses the wire form.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "pending" => Some(TaskStatus::Pending),
            "success" => Some(TaskStatus::Success),
            "failure" => Some(TaskStatus::Failure),
            "cancelling" => Some(TaskStatus::Cancelling),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Returns the wire form.
    pub fn wire_name(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::Cancelling => "cancelling",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Returns true once the task can no longer change.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Cancelled
        )
    }
}

/// The parts of a task record the operation engine reads while polling.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    /// Current status.
    pub status: TaskStatus,
    /// Progress as a fraction in `[0, 1]`.
    pub progress: f64,
    /// Result, once `Success`.
    pub result: Option<Value>,
    /// Error, once `Failure`.
    pub error: Option<Fault>,
}

impl TaskRecord {
    /// Interprets a `task.get_record` response.
    pub fn from_value(value: &Value) -> ProtocolResult<Self> {
        let record = ObjectRecord::from_value(ObjectType::Task, value)
            .map_err(|e| ProtocolError::MalformedTask(e.to_string()))?;
        Self::from_record(&record)
    }

    /// Interprets a stored task record.
    pub fn from_record(record: &ObjectRecord) -> ProtocolResult<Self> {
        let status = record
            .text("status")
            .and_then(TaskStatus::from_wire)
            .ok_or_else(|| ProtocolError::MalformedTask("missing or unknown status".into()))?;

        let progress = record
            .get("progress")
            .and_then(Value::as_float)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);

        let result = record.get("result").cloned().filter(|v| match v {
            Value::Null => false,
            Value::Text(s) => !s.is_empty(),
            _ => true,
        });

        let error = match record.get("error_info") {
            Some(v) if v.as_array().is_some_and(|items| !items.is_empty()) => {
                Some(Fault::from_value(v).map_err(|e| ProtocolError::MalformedTask(e.to_string()))?)
            }
            _ => None,
        };

        Ok(Self {
            status,
            progress,
            result,
            error,
        })
    }

    /// Returns progress as a percentage in `[0, 100]`.
    pub fn percent(&self) -> f64 {
        self.progress * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(status: &str, progress: f64) -> ObjectRecord {
        ObjectRecord::new(ObjectType::Task)
            .field("status", status)
            .field("progress", progress)
            .field("result", "")
            .field("error_info", Value::Array(vec![]))
    }

    #[test]
    fn pending_task() {
        let record = TaskRecord::from_record(&task("pending", 0.5)).unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.percent(), 50.0);
        assert!(record.result.is_none());
        assert!(record.error.is_none());
        assert!(!record.status.is_finished());
    }

    #[test]
    fn failed_task_carries_fault() {
        let raw = task("failure", 1.0)
            .field("error_info", Value::from(vec!["PIF_INVALID_STATE", "OpaqueRef:p"]))
            .to_value();
        let record = TaskRecord::from_value(&raw).unwrap();
        assert_eq!(record.status, TaskStatus::Failure);
        assert_eq!(record.error.unwrap().code, "PIF_INVALID_STATE");
    }

    #[test]
    fn successful_task_carries_result() {
        let record =
            TaskRecord::from_record(&task("success", 1.0).field("result", "OpaqueRef:bond"))
                .unwrap();
        assert_eq!(
            record.result.and_then(|v| v.as_object_ref()).map(|r| r.to_string()),
            Some("OpaqueRef:bond".to_string())
        );
    }

    #[test]
    fn progress_is_clamped() {
        let record = TaskRecord::from_record(&task("pending", 7.0)).unwrap();
        assert_eq!(record.progress, 1.0);
    }

    #[test]
    fn unknown_status_is_malformed() {
        assert!(TaskRecord::from_record(&task("exploded", 0.0)).is_err());
        assert!(TaskRecord::from_value(&Value::Null).is_err());
    }
}
