pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use uuid::Uuid;

/// Bounded replay list key for a run's published frames.
pub(crate) fn responses_key(run_id: Uuid) -> String {
    format!("run:{run_id}:responses")
}

/// Exclusive lock key backing the per-run lease. The
/// `active_run:{instance}:{run}` key is instance-scoped and serves as a
/// liveness marker; exclusion needs a single canonical key per run.
pub(crate) fn lease_lock_key(run_id: Uuid) -> String {
    format!("active_run:lock:{run_id}")
}
