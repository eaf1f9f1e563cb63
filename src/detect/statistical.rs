//! Z-score fallback detector for services without a trained model.

use crate::detect::anomaly::Dispersion;
use crate::detect::{AnomalyDetails, AnomalyRecord, DetectionMethod, Feature, FeatureSignal, MetricSample};
use tracing::{debug, info};

/// Batches smaller than this cannot estimate dispersion.
pub const MIN_BATCH: usize = 10;
pub const Z_THRESHOLD: f64 = 3.0;
/// maxZ / 10 maps onto the [0, 1] score scale.
const SCORE_SCALE: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct StatisticalDetector {
    z_threshold: f64,
}

impl Default for StatisticalDetector {
    fn default() -> Self {
        Self { z_threshold: Z_THRESHOLD }
    }
}

impl StatisticalDetector {
    pub fn detect(&self, samples: &[MetricSample]) -> Vec<AnomalyRecord> {
        if samples.len() < MIN_BATCH {
            debug!(samples = samples.len(), "too few samples for statistical detection");
            return Vec::new();
        }

        let stats: Vec<(Feature, Dispersion)> = Feature::ALL
            .iter()
            .map(|&feature| (feature, Dispersion::of(samples.iter().map(|s| s.feature(feature)))))
            .collect();

        let mut anomalies = Vec::new();
        for sample in samples {
            let mut signals = Vec::new();
            let mut max_z = 0.0_f64;

            for &(feature, dispersion) in &stats {
                let value = sample.feature(feature);
                let Some(z) = dispersion.z_score(value) else {
                    continue;
                };
                if z > self.z_threshold {
                    signals.push(FeatureSignal {
                        feature,
                        value,
                        z_score: z,
                        mean: dispersion.mean,
                        std: dispersion.std,
                    });
                    max_z = max_z.max(z);
                }
            }

            if signals.is_empty() {
                continue;
            }

            let score = (max_z / SCORE_SCALE).min(1.0);
            let mut details = AnomalyDetails::from_sample(sample);
            details.anomaly_signals = signals;
            anomalies.push(AnomalyRecord::new(
                sample,
                score,
                DetectionMethod::StatisticalZscore,
                details,
            ));
        }

        if !anomalies.is_empty() {
            info!(found = anomalies.len(), "statistical detector flagged samples");
        }
        anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::testutil::sample;

    fn baseline(n: usize) -> Vec<MetricSample> {
        (0..n)
            .map(|i| sample(&format!("m{i}"), "orders", 100.0 + (i % 3) as f64, 200))
            .collect()
    }

    #[test]
    fn test_small_batch_returns_nothing() {
        let mut batch = baseline(9);
        batch[0].response_time_ms = 1_000_000.0;
        assert!(StatisticalDetector::default().detect(&batch).is_empty());
    }

    #[test]
    fn test_spike_is_flagged_with_signal() {
        let mut batch = baseline(30);
        batch[7].response_time_ms = 5_000.0;
        let found = StatisticalDetector::default().detect(&batch);
        assert_eq!(found.len(), 1);
        let rec = &found[0];
        assert_eq!(rec.metric_id, "m7");
        assert_eq!(rec.detection_method, DetectionMethod::StatisticalZscore);
        assert_eq!(rec.details.anomaly_signals.len(), 1);
        let sig = &rec.details.anomaly_signals[0];
        assert_eq!(sig.feature, Feature::ResponseTimeMs);
        assert!(sig.z_score > Z_THRESHOLD);
        assert!((rec.anomaly_score - (sig.z_score / 10.0).min(1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_zero_variance_features_never_signal() {
        // status, error count and size are constant across the batch
        let mut batch = baseline(20);
        batch[3].response_time_ms = 9_000.0;
        let found = StatisticalDetector::default().detect(&batch);
        for rec in &found {
            for sig in &rec.details.anomaly_signals {
                assert_eq!(sig.feature, Feature::ResponseTimeMs);
            }
        }
    }

    #[test]
    fn test_constant_batch_is_clean() {
        let batch: Vec<_> = (0..15).map(|i| sample(&format!("m{i}"), "orders", 50.0, 200)).collect();
        assert!(StatisticalDetector::default().detect(&batch).is_empty());
    }

    #[test]
    fn test_score_is_capped_at_one() {
        let mut batch = baseline(400);
        batch[0].response_time_ms = 10_000_000.0;
        let found = StatisticalDetector::default().detect(&batch);
        let rec = found.iter().find(|r| r.metric_id == "m0").unwrap();
        assert!(rec.details.anomaly_signals[0].z_score > 10.0);
        assert_eq!(rec.anomaly_score, 1.0);
    }
}
