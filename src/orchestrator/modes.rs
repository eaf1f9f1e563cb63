use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::RwLock;

/// How a service is currently scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    Ml,
    Statistical,
    /// Never assigned. Routed like `Statistical`.
    Unset,
}

/// Per-service detection mode, shared between passes and API readers.
#[derive(Debug, Default)]
pub struct ModeStore {
    modes: RwLock<HashMap<String, DetectionMode>>,
}

impl ModeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, service: &str) -> DetectionMode {
        self.modes
            .read()
            .await
            .get(service)
            .copied()
            .unwrap_or(DetectionMode::Unset)
    }

    pub async fn set(&self, service: &str, mode: DetectionMode) {
        self.modes.write().await.insert(service.to_string(), mode);
    }

    /// Record the statistical fallback unless the service is already on a
    /// model. Returns whether the mode changed.
    pub async fn fall_back(&self, service: &str) -> bool {
        let mut modes = self.modes.write().await;
        match modes.get(service) {
            Some(DetectionMode::Ml) | Some(DetectionMode::Statistical) => false,
            _ => {
                modes.insert(service.to_string(), DetectionMode::Statistical);
                true
            }
        }
    }

    pub async fn snapshot(&self) -> HashMap<String, DetectionMode> {
        self.modes.read().await.clone()
    }
}
