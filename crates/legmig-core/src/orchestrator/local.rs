use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use super::queue::Queue;
use super::types::{LeaseToken, Task, MIN_LEASE_TTL_MS};
use super::util::now_millis;

/// In-memory queue for single-process runs and tests. Jobs do not survive
/// the process.
#[derive(Clone)]
pub struct LocalQueue {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    // FIFO per priority; lowest key runs first
    queues: Mutex<BTreeMap<i32, VecDeque<Task>>>,
    pending: Mutex<HashMap<String, (Task, u64)>>, // lease_id -> (task, expires_at_ms)
    delayed: Mutex<HashSet<String>>, // task ids sleeping until due
    lease_ttl_ms: u64,
    sweeper_shutdown: Notify,
    stop_flag: AtomicBool,
}

impl LocalInner {
    fn push(&self, t: Task) {
        self.queues.lock().entry(t.priority).or_default().push_back(t);
    }

    fn requeue_expired(&self, now: u64) -> usize {
        let expired: Vec<Task> = {
            let mut pend = self.pending.lock();
            let lids: Vec<String> = pend
                .iter()
                .filter_map(|(lid, (_t, exp))| (*exp <= now).then(|| lid.clone()))
                .collect();
            lids.into_iter()
                .filter_map(|lid| pend.remove(&lid).map(|(t, _)| t))
                .collect()
        };
        let n = expired.len();
        for mut t in expired {
            t.attempt = t.attempt.saturating_add(1);
            self.push(t);
        }
        n
    }
}

impl LocalQueue {
    /// Must be called from within a tokio runtime: a lease sweeper task is
    /// spawned that re-enqueues expired leases.
    pub fn with_lease_ttl(ttl_ms: u64) -> Self {
        let inner = Arc::new(LocalInner {
            queues: Mutex::new(BTreeMap::new()),
            pending: Mutex::new(HashMap::new()),
            delayed: Mutex::new(HashSet::new()),
            lease_ttl_ms: ttl_ms.max(MIN_LEASE_TTL_MS),
            sweeper_shutdown: Notify::new(),
            stop_flag: AtomicBool::new(false),
        });
        let sweeper = Arc::downgrade(&inner);
        tokio::spawn(async move {
            loop {
                let Some(inner) = sweeper.upgrade() else {
                    break;
                };
                if inner.stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                    _ = inner.sweeper_shutdown.notified() => continue,
                }
                let requeued = inner.requeue_expired(now_millis());
                if requeued > 0 {
                    tracing::debug!(requeued, "local queue re-enqueued expired leases");
                }
            }
        });
        Self { inner }
    }

    fn schedule(&self, task: Task, delay_ms: u64) {
        self.inner.delayed.lock().insert(task.id.clone());
        let q = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let id = task.id.clone();
            q.inner.push(task);
            q.inner.delayed.lock().remove(&id);
        });
    }
}

#[async_trait::async_trait]
impl Queue for LocalQueue {
    async fn enqueue(&self, mut t: Task) -> anyhow::Result<String> {
        if t.id.is_empty() {
            t.id = Uuid::new_v4().to_string();
        }
        let id = t.id.clone();
        self.inner.push(t);
        Ok(id)
    }

    async fn enqueue_after(&self, mut t: Task, delay_ms: u64) -> anyhow::Result<String> {
        if delay_ms == 0 {
            return self.enqueue(t).await;
        }
        if t.id.is_empty() {
            t.id = Uuid::new_v4().to_string();
        }
        let id = t.id.clone();
        self.schedule(t, delay_ms);
        Ok(id)
    }

    async fn try_dequeue(&self, _group: &str) -> anyhow::Result<Option<(Task, LeaseToken)>> {
        let task = {
            let mut map = self.inner.queues.lock();
            let mut selected: Option<Task> = None;
            let mut empty_key: Option<i32> = None;
            for (priority, queue) in map.iter_mut() {
                if let Some(task) = queue.pop_front() {
                    if queue.is_empty() {
                        empty_key = Some(*priority);
                    }
                    selected = Some(task);
                    break;
                }
            }
            if let Some(key) = empty_key {
                map.remove(&key);
            }
            selected
        };
        let Some(task) = task else {
            return Ok(None);
        };
        let lease_id = Uuid::new_v4().to_string();
        let exp = now_millis() + self.inner.lease_ttl_ms;
        self.inner
            .pending
            .lock()
            .insert(lease_id.clone(), (task.clone(), exp));
        let task_id = task.id.clone();
        Ok(Some((
            task,
            LeaseToken {
                task_id,
                lease_id,
                expires_at_ms: exp,
            },
        )))
    }

    async fn ack(&self, lease: LeaseToken) -> anyhow::Result<()> {
        self.inner.pending.lock().remove(&lease.lease_id);
        Ok(())
    }

    async fn nack(&self, lease: LeaseToken, retry_after_ms: Option<u64>) -> anyhow::Result<()> {
        let removed = self.inner.pending.lock().remove(&lease.lease_id);
        if let Some((mut task, _exp)) = removed {
            task.attempt = task.attempt.saturating_add(1);
            match retry_after_ms {
                Some(delay) if delay > 0 => self.schedule(task, delay),
                _ => self.inner.push(task),
            }
        }
        Ok(())
    }

    async fn outstanding(&self) -> anyhow::Result<usize> {
        let queued: usize = self.inner.queues.lock().values().map(VecDeque::len).sum();
        let leased = self.inner.pending.lock().len();
        Ok(queued + leased + self.inner.delayed.lock().len())
    }

    async fn waiting(&self, ids: &[String]) -> anyhow::Result<usize> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let queued = self
            .inner
            .queues
            .lock()
            .values()
            .flatten()
            .filter(|t| wanted.contains(t.id.as_str()))
            .count();
        let now = now_millis();
        let expired = self
            .inner
            .pending
            .lock()
            .values()
            .filter(|(t, exp)| *exp <= now && wanted.contains(t.id.as_str()))
            .count();
        let delayed = self
            .inner
            .delayed
            .lock()
            .iter()
            .filter(|id| wanted.contains(id.as_str()))
            .count();
        Ok(queued + expired + delayed)
    }
}

impl Drop for LocalQueue {
    fn drop(&mut self) {
        // only signal shutdown when this is the final handle
        if Arc::strong_count(&self.inner) == 1 {
            self.inner.stop_flag.store(true, Ordering::SeqCst);
            self.inner.sweeper_shutdown.notify_waiters();
        }
    }
}
