//! Configuration for the operation engine.

use std::time::Duration;

/// Configuration for the operation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between `task.get_record` polls.
    pub task_poll_interval: Duration,
    /// Interval between store checks while waiting for a side-effect object.
    pub object_poll_interval: Duration,
    /// How long to wait for a side-effect object to appear in the store.
    pub object_wait_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_poll_interval: Duration::from_millis(900),
            object_poll_interval: Duration::from_millis(50),
            object_wait_timeout: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Sets the task poll interval.
    pub fn with_task_poll_interval(mut self, interval: Duration) -> Self {
        self.task_poll_interval = interval;
        self
    }

    /// Sets the side-effect wait timeout.
    pub fn with_object_wait_timeout(mut self, timeout: Duration) -> Self {
        self.object_wait_timeout = timeout;
        self
    }

    /// A configuration for tests: fast polling, short waits.
    pub fn fast() -> Self {
        Self {
            task_poll_interval: Duration::from_millis(5),
            object_poll_interval: Duration::from_millis(5),
            object_wait_timeout: Duration::from_secs(5),
        }
    }
}
