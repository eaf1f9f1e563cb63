//! Trace-based root cause correlation.
//!
//! All samples sharing a trace id are ordered by time; the earliest hop that
//! shows an error, a 4xx/5xx status or a slow response is taken as the root
//! cause, and every hop after it as impacted.

use crate::detect::{AnomalyDetails, Enrichment, MetricSample, RootCause};

const SLOW_HOP_MS: f64 = 500.0;
const HIGH_LATENCY_MS: f64 = 1000.0;

pub struct RootCauseCorrelator;

impl RootCauseCorrelator {
    pub fn analyze(samples: &[MetricSample]) -> Enrichment {
        if samples.is_empty() {
            return Enrichment::default();
        }

        // stable: ties keep repository order
        let mut sorted: Vec<&MetricSample> = samples.iter().collect();
        sorted.sort_by_key(|s| s.timestamp);

        let service_chain: Vec<String> = sorted.iter().map(|s| s.service.clone()).collect();

        let root_idx = sorted.iter().position(|s| is_suspect(s));
        let (root_cause, impacted_services) = match root_idx {
            Some(idx) => {
                let hop = sorted[idx];
                let cause = RootCause {
                    service: hop.service.clone(),
                    metric_id: hop.id.clone(),
                    method: hop.method.clone(),
                    path: hop.path.clone(),
                    timestamp: hop.timestamp,
                    error_details: AnomalyDetails::from_sample(hop),
                };
                let impacted = sorted[idx + 1..].iter().map(|s| s.service.clone()).collect();
                (Some(cause), impacted)
            }
            None => (None, Vec::new()),
        };

        let suggested_action = root_cause.as_ref().map(suggest_action);

        Enrichment {
            root_cause,
            service_chain,
            impacted_services,
            suggested_action,
        }
    }
}

fn is_suspect(s: &MetricSample) -> bool {
    s.error_count > 0 || s.status_code >= 400 || s.response_time_ms > SLOW_HOP_MS
}

/// First matching rule wins.
pub fn suggest_action(cause: &RootCause) -> String {
    let d = &cause.error_details;
    if d.error_count > 0 {
        format!("Check errors in {}, restart if recurring.", cause.service)
    } else if d.status_code >= 500 {
        format!("Check backend or service dependencies for {}.", cause.service)
    } else if d.status_code == 400 {
        "Check request payload or upstream data.".to_string()
    } else if d.response_time_ms > HIGH_LATENCY_MS {
        format!("High latency in {}; check resource utilization.", cause.service)
    } else {
        "Investigate further.".to_string()
    }
}
