use tracing::trace;

// Lightweight metrics helpers that stay safe in offline builds.
// These intentionally avoid pulling in metrics macros to keep deps stable.

pub fn job_finished(status: &'static str) {
    trace!(
        target = "avatar.metrics",
        status = status,
        "jobs_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "avatar.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}
