//! Job queues feeding claimed batches to the runner.

mod ledger;
mod local;
mod queue;
mod types;
mod util;

pub use ledger::LedgerQueue;
pub use local::LocalQueue;
pub use queue::Queue;
pub use types::{BatchJob, LeaseToken, Task, BATCH_JOB_KIND, MIN_LEASE_TTL_MS};
pub use util::now_millis;
