//! Anomaly detection: data model, statistical fallback, trace correlation and
//! the trainable outlier model.

pub mod anomaly;
pub mod correlation;
pub mod model;
pub mod statistical;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("insufficient training data: need {needed} samples, have {have}")]
    InsufficientTrainingData { needed: usize, have: usize },

    #[error("no trained model for service {0}")]
    ScoringUnavailable(String),

    #[error("model failure: {0}")]
    ModelFailure(String),
}

/// The fixed feature set every detector works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    ResponseTimeMs,
    StatusCode,
    ErrorCount,
    ResponseSizeBytes,
}

impl Feature {
    pub const ALL: [Feature; 4] = [
        Feature::ResponseTimeMs,
        Feature::StatusCode,
        Feature::ErrorCount,
        Feature::ResponseSizeBytes,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Feature::ResponseTimeMs => "response_time_ms",
            Feature::StatusCode => "status_code",
            Feature::ErrorCount => "error_count",
            Feature::ResponseSizeBytes => "response_size_bytes",
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One request metric row as stored by the metrics pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    #[serde(default = "new_sample_id")]
    pub id: String,
    pub service: String,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: f64,
    pub status_code: i64,
    #[serde(default)]
    pub request_count: i64,
    #[serde(default)]
    pub error_count: i64,
    #[serde(default)]
    pub response_size_bytes: Option<i64>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn new_sample_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl MetricSample {
    pub fn feature(&self, feature: Feature) -> f64 {
        match feature {
            Feature::ResponseTimeMs => self.response_time_ms,
            Feature::StatusCode => self.status_code as f64,
            Feature::ErrorCount => self.error_count as f64,
            Feature::ResponseSizeBytes => self.response_size_bytes.unwrap_or(0) as f64,
        }
    }

    pub fn feature_vector(&self) -> [f64; 4] {
        Feature::ALL.map(|f| self.feature(f))
    }
}

/// Which detector produced an anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    IsolationForest,
    StatisticalZscore,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::IsolationForest => "isolation_forest",
            DetectionMethod::StatisticalZscore => "statistical_zscore",
        }
    }
}

/// A single feature that crossed the z-score threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSignal {
    pub feature: Feature,
    pub value: f64,
    pub z_score: f64,
    pub mean: f64,
    pub std: f64,
}

/// Raw feature values of the flagged sample, plus any per-feature signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyDetails {
    pub response_time_ms: f64,
    pub status_code: i64,
    pub error_count: i64,
    pub response_size_bytes: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomaly_signals: Vec<FeatureSignal>,
}

impl AnomalyDetails {
    pub fn from_sample(sample: &MetricSample) -> Self {
        Self {
            response_time_ms: sample.response_time_ms,
            status_code: sample.status_code,
            error_count: sample.error_count,
            response_size_bytes: sample.response_size_bytes.unwrap_or(0),
            anomaly_signals: Vec::new(),
        }
    }
}

/// The hop a trace most likely failed at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCause {
    pub service: String,
    pub metric_id: String,
    pub method: Option<String>,
    pub path: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub error_details: AnomalyDetails,
}

/// Trace-level context merged into an alert-worthy anomaly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub root_cause: Option<RootCause>,
    pub service_chain: Vec<String>,
    pub impacted_services: Vec<String>,
    pub suggested_action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub metric_id: String,
    pub service: String,
    pub trace_id: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    /// Always within [0, 1] regardless of detector.
    pub anomaly_score: f64,
    pub detection_method: DetectionMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub details: AnomalyDetails,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<Enrichment>,
}

impl AnomalyRecord {
    pub fn new(
        sample: &MetricSample,
        anomaly_score: f64,
        detection_method: DetectionMethod,
        details: AnomalyDetails,
    ) -> Self {
        Self {
            metric_id: sample.id.clone(),
            service: sample.service.clone(),
            trace_id: sample.trace_id.clone(),
            method: sample.method.clone(),
            path: sample.path.clone(),
            anomaly_score,
            detection_method,
            model_version: None,
            timestamp: sample.timestamp,
            details,
            threshold: None,
            enrichment: None,
        }
    }

    /// Inclusive at equality.
    pub fn is_alert_worthy(&self, threshold: f64) -> bool {
        self.anomaly_score >= threshold
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::sample;
    use super::*;

    #[test]
    fn test_missing_response_size_defaults_to_zero() {
        let mut s = sample("m1", "orders", 120.0, 200);
        s.response_size_bytes = None;
        assert_eq!(s.feature(Feature::ResponseSizeBytes), 0.0);
        assert_eq!(s.feature_vector(), [120.0, 200.0, 0.0, 0.0]);
    }

    #[test]
    fn test_ingested_sample_defaults() {
        let s: MetricSample = serde_json::from_value(serde_json::json!({
            "service": "orders",
            "timestamp": "2026-10-01T12:00:00Z",
            "response_time_ms": 42.0,
            "status_code": 200
        }))
        .unwrap();
        assert_eq!(s.id.len(), 36);
        assert_eq!(s.error_count, 0);
        assert!(s.trace_id.is_none());
        assert!(s.response_size_bytes.is_none());
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let s = sample("m1", "orders", 120.0, 200);
        let rec = AnomalyRecord::new(
            &s,
            0.65,
            DetectionMethod::StatisticalZscore,
            AnomalyDetails::from_sample(&s),
        );
        assert!(rec.is_alert_worthy(0.65));
        assert!(!rec.is_alert_worthy(0.650001));
    }

    #[test]
    fn test_enrichment_flattens_into_record() {
        let s = sample("m1", "orders", 120.0, 200);
        let mut rec = AnomalyRecord::new(
            &s,
            0.9,
            DetectionMethod::IsolationForest,
            AnomalyDetails::from_sample(&s),
        );
        rec.enrichment = Some(Enrichment {
            service_chain: vec!["gateway".into(), "orders".into()],
            ..Default::default()
        });
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["service_chain"][1], "orders");
        assert_eq!(v["detection_method"], "isolation_forest");
    }
}
