use super::types::{LeaseToken, Task};

/// Queue abstraction for distributing batch jobs.
#[async_trait::async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue a task; returns effective task id.
    async fn enqueue(&self, t: Task) -> anyhow::Result<String>;
    /// Enqueue a task that becomes visible after `delay_ms`.
    async fn enqueue_after(&self, t: Task, delay_ms: u64) -> anyhow::Result<String>;
    /// Lease the next ready task for this consumer group, if any. Never waits.
    async fn try_dequeue(&self, group: &str) -> anyhow::Result<Option<(Task, LeaseToken)>>;
    /// Acknowledge and remove a task using its lease token.
    async fn ack(&self, lease: LeaseToken) -> anyhow::Result<()>;
    /// Negative-acknowledge; optionally schedule retry after millis.
    async fn nack(&self, lease: LeaseToken, retry_after_ms: Option<u64>) -> anyhow::Result<()>;
    /// Tasks that are queued, delayed or leased.
    async fn outstanding(&self) -> anyhow::Result<usize>;
    /// How many of `ids` still wait for a consumer: queued, delayed, or
    /// under an expired lease. Tasks leased to a live consumer are its own.
    async fn waiting(&self, ids: &[String]) -> anyhow::Result<usize>;
}
