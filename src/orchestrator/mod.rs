//! Detection orchestrator.
//!
//! Drives training (with backfill escalation) and hybrid detection across
//! every known service, routing each service to the trained model or the
//! statistical fallback, enriching alert-worthy anomalies with trace context
//! and handing them to the publisher.

pub mod modes;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::DetectionConfig;
use crate::detect::correlation::RootCauseCorrelator;
use crate::detect::model::{OutlierModel, ScoredSample};
use crate::detect::statistical::StatisticalDetector;
use crate::detect::{AnomalyDetails, AnomalyRecord, DetectError, DetectionMethod, MetricSample};
use crate::publisher::ResilientPublisher;
use crate::storage::MetricsRepository;

pub use self::modes::{DetectionMode, ModeStore};

/// Wider windows tried when the configured training window is too sparse.
const BACKFILL_WINDOWS_MINUTES: [u64; 2] = [360, 1440];
const SCORE_EPSILON: f64 = 1e-10;

#[derive(Debug, Clone, Serialize)]
pub struct TrainingResult {
    pub success: bool,
    pub message: String,
    pub services_trained: Vec<String>,
    /// `"<service> (<window>)"` for every service trained on a backfill window.
    pub backfill_used: Vec<String>,
    pub total_samples: usize,
    pub timestamp: DateTime<Utc>,
}

impl TrainingResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            services_trained: Vec::new(),
            backfill_used: Vec::new(),
            total_samples: 0,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceDetail {
    pub name: String,
    pub detection_mode: DetectionMode,
    pub model_trained: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_training: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub total_services: usize,
    pub ml_enabled: usize,
    pub statistical_fallback: usize,
    pub services: Vec<ServiceDetail>,
}

pub struct Orchestrator {
    repo: Arc<dyn MetricsRepository>,
    model: Arc<dyn OutlierModel>,
    publisher: ResilientPublisher,
    modes: ModeStore,
    config: DetectionConfig,
    /// Serializes training passes triggered by the scheduler and the API.
    train_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        repo: Arc<dyn MetricsRepository>,
        model: Arc<dyn OutlierModel>,
        publisher: ResilientPublisher,
        config: DetectionConfig,
    ) -> Self {
        Self {
            repo,
            model,
            publisher,
            modes: ModeStore::new(),
            config,
            train_lock: Mutex::new(()),
        }
    }

    pub fn publisher(&self) -> &ResilientPublisher {
        &self.publisher
    }

    pub fn repository(&self) -> &Arc<dyn MetricsRepository> {
        &self.repo
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn modes(&self) -> &ModeStore {
        &self.modes
    }

    /// Mark every service with an already-loaded model as `ml`.
    pub async fn initialize(&self) -> usize {
        let trained = self.model.trained_services();
        for service in &trained {
            self.modes.set(service, DetectionMode::Ml).await;
            info!(%service, "ml mode (model loaded)");
        }
        trained.len()
    }

    pub fn has_trained_models(&self) -> bool {
        !self.model.trained_services().is_empty()
    }

    /// Most recent training time across all models.
    pub fn last_training(&self) -> Option<DateTime<Utc>> {
        self.model
            .trained_services()
            .iter()
            .filter_map(|s| self.model.model_info(s))
            .map(|info| info.trained_at)
            .max()
    }

    fn training_windows(&self) -> Vec<u64> {
        let first = self.config.training_window_minutes;
        let mut windows = vec![first];
        windows.extend(BACKFILL_WINDOWS_MINUTES.iter().copied().filter(|&w| w > first));
        windows
    }

    /// Widen the window until it yields enough samples. Returns the last
    /// batch fetched and the window it came from.
    async fn collect_training_batch(&self, service: &str) -> (Vec<MetricSample>, u64) {
        let windows = self.training_windows();
        let mut batch = (Vec::new(), self.config.training_window_minutes);

        for (i, &window) in windows.iter().enumerate() {
            let samples = match self.repo.fetch_by_service(service, window as i64).await {
                Ok(samples) => samples,
                Err(e) => {
                    warn!(%service, window_minutes = window, error = %e, "training fetch failed");
                    Vec::new()
                }
            };
            if samples.len() >= self.config.min_samples {
                return (samples, window);
            }
            if i + 1 < windows.len() {
                info!(
                    %service,
                    samples = samples.len(),
                    window_minutes = window,
                    "not enough samples, widening training window"
                );
            }
            batch = (samples, window);
        }
        batch
    }

    /// One full training pass over every active service.
    pub async fn train_all(&self) -> TrainingResult {
        let _guard = self.train_lock.lock().await;
        info!("starting training for all services");

        let services = match self.repo.active_services().await {
            Ok(services) => services,
            Err(e) => {
                error!(error = %e, "cannot list services for training");
                return TrainingResult::failed(format!("repository unavailable: {e}"));
            }
        };
        if services.is_empty() {
            warn!("no services found");
            return TrainingResult::failed("No services found");
        }

        let mut services_trained = Vec::new();
        let mut backfill_used = Vec::new();
        let mut total_samples = 0;

        for service in services {
            let (samples, window) = self.collect_training_batch(&service).await;
            let count = samples.len();

            if count < self.config.min_samples {
                info!(%service, samples = count, needed = self.config.min_samples, "skipping training");
                if self.model.is_trained(&service) {
                    debug!(%service, "keeping existing model");
                } else if self.modes.fall_back(&service).await {
                    info!(%service, "using statistical fallback");
                }
                continue;
            }

            let model = Arc::clone(&self.model);
            let svc = service.clone();
            match tokio::task::spawn_blocking(move || model.train(&svc, &samples)).await {
                Ok(Ok(model_info)) => {
                    self.modes.set(&service, DetectionMode::Ml).await;
                    if window != self.config.training_window_minutes {
                        backfill_used.push(format!("{service} ({})", window_label(window)));
                    }
                    info!(%service, samples = count, version = %model_info.version, "trained model");
                    services_trained.push(service);
                    total_samples += count;
                }
                Ok(Err(e)) => warn!(%service, error = %e, "training failed"),
                Err(e) => error!(%service, error = %e, "training task aborted"),
            }
        }

        let result = TrainingResult {
            success: !services_trained.is_empty(),
            message: format!("Trained {} services", services_trained.len()),
            services_trained,
            backfill_used,
            total_samples,
            timestamp: Utc::now(),
        };
        info!(
            trained = result.services_trained.len(),
            samples = result.total_samples,
            backfill = ?result.backfill_used,
            "training complete"
        );
        result
    }

    async fn target_services(&self, service: Option<&str>) -> Vec<String> {
        if let Some(service) = service {
            return vec![service.to_string()];
        }
        let mut targets: BTreeSet<String> = self.model.trained_services().into_iter().collect();
        match self.repo.active_services().await {
            Ok(active) => targets.extend(active),
            Err(e) => warn!(error = %e, "cannot list active services, checking trained services only"),
        }
        targets.into_iter().collect()
    }

    /// Hybrid detection over one service or every known service. Returns the
    /// alert-worthy anomalies, published or not.
    pub async fn detect_all(&self, service: Option<&str>) -> Vec<AnomalyRecord> {
        let targets = self.target_services(service).await;
        let mut alerts = Vec::new();

        for svc in &targets {
            let samples = match self
                .repo
                .fetch_by_service(svc, self.config.detection_window_minutes as i64)
                .await
            {
                Ok(samples) => samples,
                Err(e) => {
                    warn!(service = %svc, error = %e, "detection fetch failed");
                    continue;
                }
            };
            if samples.is_empty() {
                continue;
            }

            let anomalies = self.score_service(svc, samples).await;
            for anomaly in anomalies {
                if let Some(alert) = self.escalate(anomaly).await {
                    alerts.push(alert);
                }
            }
        }

        if !alerts.is_empty() {
            info!(anomalies = alerts.len(), services = targets.len(), "detected anomalies");
        }
        alerts
    }

    async fn score_service(&self, service: &str, samples: Vec<MetricSample>) -> Vec<AnomalyRecord> {
        let mode = self.modes.get(service).await;
        if mode != DetectionMode::Ml || !self.model.is_trained(service) {
            let anomalies = StatisticalDetector::default().detect(&samples);
            debug!(%service, checked = samples.len(), "statistical detection");
            return anomalies;
        }

        let model = Arc::clone(&self.model);
        let svc = service.to_string();
        let scored = tokio::task::spawn_blocking(move || {
            let scored = model.score(&svc, &samples);
            (samples, scored)
        })
        .await;

        let (samples, result) = match scored {
            Ok(pair) => pair,
            Err(e) => {
                error!(%service, error = %e, "scoring task aborted");
                return Vec::new();
            }
        };

        match result {
            Ok(scored) => {
                let version = self
                    .model
                    .model_info(service)
                    .map(|info| info.version)
                    .unwrap_or_else(|| "unknown".to_string());
                debug!(%service, checked = samples.len(), "ml detection");
                model_anomalies(&samples, &scored, &version)
            }
            Err(DetectError::ScoringUnavailable(_)) => StatisticalDetector::default().detect(&samples),
            Err(e) => {
                warn!(%service, error = %e, "model scoring failed, using statistical detector");
                StatisticalDetector::default().detect(&samples)
            }
        }
    }

    /// Attach the threshold; alert-worthy anomalies get trace enrichment and
    /// are published.
    async fn escalate(&self, mut anomaly: AnomalyRecord) -> Option<AnomalyRecord> {
        let threshold = self.config.anomaly_threshold;
        anomaly.threshold = Some(threshold);
        if !anomaly.is_alert_worthy(threshold) {
            return None;
        }

        if let Some(trace_id) = anomaly.trace_id.clone() {
            match self.repo.fetch_by_trace(&trace_id).await {
                Ok(events) => anomaly.enrichment = Some(RootCauseCorrelator::analyze(&events)),
                Err(e) => warn!(%trace_id, error = %e, "trace fetch failed, alert not enriched"),
            }
        }

        let outcome = self.publisher.publish(&anomaly).await;
        debug!(metric_id = %anomaly.metric_id, ?outcome, "alert handed to publisher");
        Some(anomaly)
    }

    pub async fn status(&self) -> ServiceStatus {
        let mut all: BTreeSet<String> = self.model.trained_services().into_iter().collect();
        match self.repo.active_services().await {
            Ok(active) => all.extend(active),
            Err(e) => warn!(error = %e, "cannot list active services for status"),
        }
        let modes = self.modes.snapshot().await;

        let services: Vec<ServiceDetail> = all
            .into_iter()
            .map(|name| {
                let info = self.model.model_info(&name);
                let detection_mode = match (modes.get(&name), &info) {
                    (Some(mode), _) => *mode,
                    (None, Some(_)) => DetectionMode::Ml,
                    (None, None) => DetectionMode::Unset,
                };
                ServiceDetail {
                    detection_mode,
                    model_trained: info.is_some(),
                    last_training: info.as_ref().map(|i| i.trained_at),
                    model_version: info.map(|i| i.version),
                    name,
                }
            })
            .collect();

        let ml_enabled = services
            .iter()
            .filter(|s| s.detection_mode == DetectionMode::Ml)
            .count();
        ServiceStatus {
            total_services: services.len(),
            ml_enabled,
            statistical_fallback: services.len() - ml_enabled,
            services,
        }
    }
}

fn window_label(minutes: u64) -> String {
    if minutes % 60 == 0 {
        format!("{}h", minutes / 60)
    } else {
        format!("{minutes}min")
    }
}

/// Turn model output into anomalies. Raw scores are min-max rescaled over the
/// batch so the most isolated sample scores 1; only model-labelled outliers
/// are kept.
fn model_anomalies(samples: &[MetricSample], scored: &[ScoredSample], version: &str) -> Vec<AnomalyRecord> {
    let (min, max) = scored
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
            (lo.min(s.raw_score), hi.max(s.raw_score))
        });

    scored
        .iter()
        .filter(|s| s.is_outlier)
        .filter_map(|s| {
            let sample = samples.get(s.index)?;
            let score = 1.0 - (s.raw_score - min) / (max - min + SCORE_EPSILON);
            let mut record = AnomalyRecord::new(
                sample,
                score.clamp(0.0, 1.0),
                DetectionMethod::IsolationForest,
                AnomalyDetails::from_sample(sample),
            );
            record.model_version = Some(version.to_string());
            Some(record)
        })
        .collect()
}
