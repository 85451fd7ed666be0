use tracing::trace;

// Metric points emitted as trace events under `crosslist.metrics`.

pub fn inc_requests(route: &'static str) {
    trace!(target = "crosslist.metrics", route = route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "crosslist.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn stage_retry(stage: &'static str, attempt: u32) {
    trace!(
        target = "crosslist.metrics",
        stage = stage,
        attempt = attempt,
        "stage_retry_inc"
    );
}

pub fn job_finished(outcome: &'static str) {
    trace!(target = "crosslist.metrics", outcome = outcome, "jobs_finished_inc");
}
