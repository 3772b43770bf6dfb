use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const BATCH_JOB_KIND: &str = "migration.batch";
pub const MIN_LEASE_TTL_MS: u64 = 100;

/// A unit of work handed to a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Operation identifier.
    pub kind: String,
    /// JSON payload for the operation.
    pub payload: serde_json::Value,
    /// Priority lane: lower runs first.
    pub priority: i32,
    /// Attempt count; incremented on re-delivery.
    pub attempt: u32,
}

impl Task {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            payload,
            priority: 0,
            attempt: 0,
        }
    }
}

/// Lease token for in-flight work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseToken {
    pub task_id: String,
    pub lease_id: String,
    /// Epoch millis when lease expires.
    pub expires_at_ms: u64,
}

/// Payload of a [`BATCH_JOB_KIND`] task: execute one claimed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJob {
    pub run_id: i64,
    pub migrate: String,
}

impl BatchJob {
    pub fn into_task(self) -> Task {
        let payload = serde_json::to_value(&self).unwrap_or_default();
        Task::new(BATCH_JOB_KIND, payload)
    }

    pub fn from_task(task: &Task) -> anyhow::Result<Self> {
        if task.kind != BATCH_JOB_KIND {
            anyhow::bail!("unexpected task kind `{}`", task.kind);
        }
        Ok(serde_json::from_value(task.payload.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batch_job_task_payload() {
        let task = BatchJob {
            run_id: 7,
            migrate: "users".into(),
        }
        .into_task();
        assert_eq!(task.kind, BATCH_JOB_KIND);
        assert_eq!(task.payload, json!({"run_id": 7, "migrate": "users"}));
        assert_eq!(BatchJob::from_task(&task).unwrap().run_id, 7);

        let other = Task::new("op.other", json!({}));
        assert!(BatchJob::from_task(&other).is_err());
    }
}
