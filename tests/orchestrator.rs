//! End-to-end detection passes over a real SQLite repository and the
//! isolation-forest model, with an in-memory broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outlierwatch::config::DetectionConfig;
use outlierwatch::detect::model::{IsolationForestModel, OutlierModel};
use outlierwatch::detect::{DetectionMethod, MetricSample};
use outlierwatch::orchestrator::{DetectionMode, Orchestrator};
use outlierwatch::publisher::{OutgoingMessage, ResilientPublisher, RetryPolicy, Transport, TransportError};
use outlierwatch::storage::{open_pool, Pool, SqliteMetricsRepository, SqliteModelStore};

#[derive(Default)]
struct MemoryBroker {
    down: AtomicBool,
    published: Mutex<Vec<(String, serde_json::Value)>>,
}

impl MemoryBroker {
    fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("broker down".into()));
        }
        Ok(())
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("broker down".into()));
        }
        let body = serde_json::from_slice(&message.payload).unwrap();
        self.published
            .lock()
            .unwrap()
            .push((message.routing_key.clone(), body));
        Ok(())
    }

    async fn close(&self) {}
}

fn metric(id: &str, service: &str, at: DateTime<Utc>, rt: f64, status: i64, size: i64) -> MetricSample {
    MetricSample {
        id: id.to_string(),
        service: service.to_string(),
        trace_id: None,
        method: Some("GET".to_string()),
        path: Some(format!("/{service}")),
        timestamp: at,
        response_time_ms: rt,
        status_code: status,
        request_count: 1,
        error_count: 0,
        response_size_bytes: Some(size),
        created_at: at,
    }
}

/// 120 healthy `orders` samples over the last 50 minutes, a spike one minute
/// ago sharing a trace with a healthy gateway hop, and a sparse `search`.
fn workload() -> Vec<MetricSample> {
    let now = Utc::now();
    let mut samples: Vec<MetricSample> = (0..120)
        .map(|i| {
            let at = now - chrono::Duration::seconds(25 * i as i64 + 10);
            let rt = 100.0 + ((i * 37) % 50) as f64;
            let size = 500 + ((i * 53) % 100) as i64;
            metric(&format!("orders-{i}"), "orders", at, rt, 200, size)
        })
        .collect();

    let mut spike = metric("orders-spike", "orders", now - chrono::Duration::seconds(60), 20_000.0, 500, 90_000);
    spike.error_count = 3;
    spike.trace_id = Some("trace-e2e".to_string());
    let mut hop = metric("gateway-1", "gateway", spike.timestamp - chrono::Duration::milliseconds(40), 15.0, 200, 128);
    hop.trace_id = Some("trace-e2e".to_string());
    samples.push(spike);
    samples.push(hop);

    samples.extend((0..5).map(|i| metric(&format!("search-{i}"), "search", now, 30.0, 200, 64)));
    samples
}

struct Stack {
    _dir: tempfile::TempDir,
    pool: Pool,
    orchestrator: Orchestrator,
    publisher: ResilientPublisher,
    broker: Arc<MemoryBroker>,
}

async fn stack(policy: RetryPolicy) -> Stack {
    let dir = tempfile::TempDir::new().unwrap();
    let pool = open_pool(dir.path().join("e2e.db").to_str().unwrap()).unwrap();
    let repo = SqliteMetricsRepository::new(pool.clone(), vec!["api".to_string()]);
    repo.insert_samples(workload()).await.unwrap();

    let config = DetectionConfig::default();
    let model = IsolationForestModel::new(
        Arc::new(SqliteModelStore::new(pool.clone())),
        config.contamination,
        config.min_samples,
    );
    let broker = Arc::new(MemoryBroker::default());
    let publisher = ResilientPublisher::new(broker.clone(), policy, 100);
    publisher.connect().await.unwrap();

    let orchestrator = Orchestrator::new(Arc::new(repo), Arc::new(model), publisher.clone(), config);
    Stack {
        _dir: dir,
        pool,
        orchestrator,
        publisher,
        broker,
    }
}

#[tokio::test]
async fn test_train_then_detect_publishes_enriched_alert() {
    let s = stack(RetryPolicy::default()).await;

    let training = s.orchestrator.train_all().await;
    assert!(training.success);
    assert_eq!(training.services_trained, vec!["orders"]);
    assert_eq!(training.total_samples, 121);
    assert!(training.backfill_used.is_empty());
    assert_eq!(s.orchestrator.modes().get("orders").await, DetectionMode::Ml);
    assert_eq!(s.orchestrator.modes().get("search").await, DetectionMode::Statistical);
    assert_eq!(s.orchestrator.modes().get("gateway").await, DetectionMode::Statistical);

    let alerts = s.orchestrator.detect_all(None).await;
    assert!(alerts.iter().all(|a| a.detection_method == DetectionMethod::IsolationForest));
    assert!(alerts.iter().all(|a| a.anomaly_score >= 0.65 && a.threshold == Some(0.65)));

    let spike = alerts
        .iter()
        .find(|a| a.metric_id == "orders-spike")
        .expect("spike should be alerted");
    assert!((spike.anomaly_score - 1.0).abs() < 1e-6);
    assert!(spike.model_version.as_deref().unwrap().starts_with("v_"));

    let enrichment = spike.enrichment.as_ref().unwrap();
    assert_eq!(enrichment.service_chain, vec!["gateway", "orders"]);
    let cause = enrichment.root_cause.as_ref().unwrap();
    assert_eq!(cause.service, "orders");
    assert!(enrichment.impacted_services.is_empty());
    assert_eq!(
        enrichment.suggested_action.as_deref(),
        Some("Check errors in orders, restart if recurring.")
    );

    let published = s.broker.published();
    assert_eq!(published.len(), alerts.len());
    let (key, body) = published
        .iter()
        .find(|(_, b)| b["metricId"] == "orders-spike")
        .unwrap();
    assert_eq!(key, "anomaly.orders");
    assert_eq!(body["eventType"], "anomaly.detected");
    assert_eq!(body["traceId"], "trace-e2e");
    assert_eq!(body["detectionMethod"], "isolation_forest");
    assert_eq!(body["details"]["error_count"], 3);
}

#[tokio::test]
async fn test_models_survive_restart() {
    let s = stack(RetryPolicy::default()).await;
    s.orchestrator.train_all().await;

    let model = IsolationForestModel::new(Arc::new(SqliteModelStore::new(s.pool.clone())), 0.02, 50);
    assert_eq!(model.load_saved(), 1);
    assert!(model.is_trained("orders"));

    let repo = SqliteMetricsRepository::new(s.pool.clone(), vec!["api".to_string()]);
    let restarted = Orchestrator::new(
        Arc::new(repo),
        Arc::new(model),
        s.publisher.clone(),
        DetectionConfig::default(),
    );
    assert_eq!(restarted.initialize().await, 1);

    let status = restarted.status().await;
    assert_eq!(status.total_services, 3);
    assert_eq!(status.ml_enabled, 1);
    let orders = status.services.iter().find(|d| d.name == "orders").unwrap();
    assert_eq!(orders.detection_mode, DetectionMode::Ml);
    assert!(orders.model_version.is_some());
}

#[tokio::test]
async fn test_alerts_buffer_through_broker_outage() {
    let policy = RetryPolicy {
        min_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        multiplier: 2,
    };
    let s = stack(policy).await;
    s.orchestrator.train_all().await;

    s.broker.down.store(true, Ordering::SeqCst);
    let alerts = s.orchestrator.detect_all(Some("orders")).await;
    assert!(!alerts.is_empty());
    assert!(!s.publisher.is_connected());
    assert_eq!(s.publisher.pending(), alerts.len());
    assert!(s.broker.published().is_empty());

    s.broker.down.store(false, Ordering::SeqCst);
    for _ in 0..200 {
        if s.publisher.pending() == 0 && s.publisher.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(s.publisher.is_connected());

    let delivered: Vec<String> = s
        .broker
        .published()
        .into_iter()
        .map(|(_, b)| b["metricId"].as_str().unwrap().to_string())
        .collect();
    let expected: Vec<String> = alerts.iter().map(|a| a.metric_id.clone()).collect();
    assert_eq!(delivered, expected);
    s.publisher.shutdown().await;
}
