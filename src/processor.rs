//! Run orchestration: the coordinator state machine, worker tasks and their pool, retry
//! policy, and per-run lifecycle wiring.

pub mod backoff;
pub mod coordinator;
pub(crate) mod lifecycle;
pub(crate) mod worker;
pub(crate) mod worker_pool;
