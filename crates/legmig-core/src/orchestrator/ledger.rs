use legmig_kernel::{JobRow, Kernel};
use uuid::Uuid;

use super::queue::Queue;
use super::types::{LeaseToken, Task, MIN_LEASE_TTL_MS};
use super::util::now_millis;

/// Durable queue stored in the ledger's `migration_jobs` table. Jobs survive
/// restarts; an expired lease is handed out again.
#[derive(Clone, Debug)]
pub struct LedgerQueue {
    kernel: Kernel,
    lease_ttl_ms: u64,
}

impl LedgerQueue {
    pub fn new(kernel: Kernel, lease_ttl_ms: u64) -> Self {
        Self {
            kernel,
            lease_ttl_ms: lease_ttl_ms.max(MIN_LEASE_TTL_MS),
        }
    }
}

fn task_from_row(row: JobRow) -> Task {
    Task {
        id: row.id,
        kind: row.kind,
        payload: row.payload,
        priority: row.priority,
        attempt: row.attempt,
    }
}

#[async_trait::async_trait]
impl Queue for LedgerQueue {
    async fn enqueue(&self, t: Task) -> anyhow::Result<String> {
        self.enqueue_after(t, 0).await
    }

    async fn enqueue_after(&self, mut t: Task, delay_ms: u64) -> anyhow::Result<String> {
        if t.id.is_empty() {
            t.id = Uuid::new_v4().to_string();
        }
        let available_at = (now_millis() + delay_ms) as i64;
        self.kernel
            .enqueue_job_async(&t.id, &t.kind, &t.payload, t.priority, t.attempt, available_at)
            .await?;
        Ok(t.id)
    }

    async fn try_dequeue(&self, _group: &str) -> anyhow::Result<Option<(Task, LeaseToken)>> {
        let lease_id = Uuid::new_v4().to_string();
        let now = now_millis();
        let Some(row) = self
            .kernel
            .lease_next_job_async(now as i64, self.lease_ttl_ms as i64, &lease_id)
            .await?
        else {
            return Ok(None);
        };
        let lease = LeaseToken {
            task_id: row.id.clone(),
            lease_id,
            expires_at_ms: now + self.lease_ttl_ms,
        };
        Ok(Some((task_from_row(row), lease)))
    }

    async fn ack(&self, lease: LeaseToken) -> anyhow::Result<()> {
        if !self.kernel.ack_job_async(&lease.lease_id).await? {
            tracing::warn!(task_id = %lease.task_id, "ack for a lease that is no longer held");
        }
        Ok(())
    }

    async fn nack(&self, lease: LeaseToken, retry_after_ms: Option<u64>) -> anyhow::Result<()> {
        let available_at = (now_millis() + retry_after_ms.unwrap_or(0)) as i64;
        self.kernel
            .nack_job_async(&lease.lease_id, available_at)
            .await?;
        Ok(())
    }

    async fn outstanding(&self) -> anyhow::Result<usize> {
        Ok(self.kernel.count_jobs_async().await?.max(0) as usize)
    }

    async fn waiting(&self, ids: &[String]) -> anyhow::Result<usize> {
        let n = self
            .kernel
            .count_waiting_jobs_async(ids.to_vec(), now_millis() as i64)
            .await?;
        Ok(n.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn ledger_queue_survives_reopen_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.sqlite");
        {
            let queue = LedgerQueue::new(Kernel::open(&path).unwrap(), 60_000);
            queue.enqueue(Task::new("migration.batch", json!({"run_id": 1, "migrate": "a"})))
                .await
                .unwrap();
        }
        let queue = LedgerQueue::new(Kernel::open(&path).unwrap(), 60_000);
        assert_eq!(queue.outstanding().await.unwrap(), 1);
        let (task, lease) = queue.try_dequeue("workers").await.unwrap().unwrap();
        assert_eq!(task.payload["migrate"], "a");
        assert!(queue.try_dequeue("workers").await.unwrap().is_none());

        queue.nack(lease, Some(0)).await.unwrap();
        let (again, lease) = queue.try_dequeue("workers").await.unwrap().unwrap();
        assert_eq!(again.id, task.id);
        assert_eq!(again.attempt, 1);
        queue.ack(lease).await.unwrap();
        assert_eq!(queue.outstanding().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delayed_job_is_invisible_until_due() {
        let dir = tempfile::tempdir().unwrap();
        let queue = LedgerQueue::new(Kernel::open(&dir.path().join("l.sqlite")).unwrap(), 60_000);
        queue
            .enqueue_after(Task::new("k", json!({})), 60_000)
            .await
            .unwrap();
        assert!(queue.try_dequeue("g").await.unwrap().is_none());
        assert_eq!(queue.outstanding().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn leased_jobs_are_not_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let queue = LedgerQueue::new(Kernel::open(&dir.path().join("l.sqlite")).unwrap(), 60_000);
        let held = queue.enqueue(Task::new("k", json!({}))).await.unwrap();
        let (task, _lease) = queue.try_dequeue("g").await.unwrap().unwrap();
        assert_eq!(task.id, held);
        let queued = queue.enqueue(Task::new("k", json!({}))).await.unwrap();

        assert_eq!(queue.waiting(&[held.clone()]).await.unwrap(), 0);
        assert_eq!(queue.waiting(&[held, queued]).await.unwrap(), 1);
        assert_eq!(queue.outstanding().await.unwrap(), 2);
    }
}
