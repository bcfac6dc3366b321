use strand_types::{UsageRecord, UsageRecorder};

/// Default billing collaborator: logs the record and moves on. The real
/// accounting service implements the same trait behind the wire.
#[derive(Debug, Default)]
pub struct TracingUsageRecorder;

impl UsageRecorder for TracingUsageRecorder {
    fn record_usage(&self, record: UsageRecord) {
        tracing::info!(
            target: "billing",
            model = %record.model_name,
            run_id = ?record.run_id,
            user_id = ?record.user_id,
            prompt_tokens = ?record.prompt_tokens,
            completion_tokens = ?record.completion_tokens,
            duration_ms = (record.ended_at - record.started_at).num_milliseconds(),
            "usage recorded"
        );
    }
}
