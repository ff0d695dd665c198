//! Metric names and descriptions.
//!
//! The engine emits through the `metrics` facade; hosts install whatever
//! recorder they run. Calling [`describe_metrics`] once registers units and
//! descriptions with that recorder.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};

pub(crate) const METRIC_FETCH_TOTAL: &str = "freshet_fetch_total";
pub(crate) const METRIC_FETCH_ERROR_TOTAL: &str = "freshet_fetch_error_total";
pub(crate) const METRIC_DEDUPE_HIT_TOTAL: &str = "freshet_dedupe_hit_total";
pub(crate) const METRIC_DISCARDED_TOTAL: &str = "freshet_discarded_total";
pub(crate) const METRIC_RETRY_SCHEDULED_TOTAL: &str = "freshet_retry_scheduled_total";
pub(crate) const METRIC_MUTATION_TOTAL: &str = "freshet_mutation_total";
pub(crate) const METRIC_FETCH_DURATION_MS: &str = "freshet_fetch_duration_ms";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Register metric descriptions with the installed recorder. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_FETCH_TOTAL,
            Unit::Count,
            "Total number of fetch invocations started."
        );
        describe_counter!(
            METRIC_FETCH_ERROR_TOTAL,
            Unit::Count,
            "Total number of fetch invocations that failed."
        );
        describe_counter!(
            METRIC_DEDUPE_HIT_TOTAL,
            Unit::Count,
            "Total number of revalidations that joined an in-flight request."
        );
        describe_counter!(
            METRIC_DISCARDED_TOTAL,
            Unit::Count,
            "Total number of fetch results discarded by the race or mutation guard."
        );
        describe_counter!(
            METRIC_RETRY_SCHEDULED_TOTAL,
            Unit::Count,
            "Total number of error retries scheduled."
        );
        describe_counter!(
            METRIC_MUTATION_TOTAL,
            Unit::Count,
            "Total number of explicit mutations issued."
        );
        describe_histogram!(
            METRIC_FETCH_DURATION_MS,
            Unit::Milliseconds,
            "Wall-clock duration of fetch invocations."
        );
    });
}
