//! Model persistence keyed by service name.

use rusqlite::params;
use tracing::{info, warn};

use crate::detect::model::SavedModel;
use crate::storage::{encode_time, Pool, StorageError};

pub trait ModelStore: Send + Sync {
    /// Persist `model`, replacing any previous model for the same service.
    fn save(&self, model: &SavedModel) -> Result<(), StorageError>;

    fn load_all(&self) -> Result<Vec<SavedModel>, StorageError>;

    fn load(&self, service: &str) -> Result<Option<SavedModel>, StorageError> {
        Ok(self.load_all()?.into_iter().find(|m| m.service == service))
    }

    fn list_services(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.load_all()?.into_iter().map(|m| m.service).collect())
    }
}

pub struct SqliteModelStore {
    pool: Pool,
}

impl SqliteModelStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl ModelStore for SqliteModelStore {
    fn save(&self, model: &SavedModel) -> Result<(), StorageError> {
        let conn = self.pool.get()?;
        let features_json = serde_json::to_string(&model.features)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let model_json = serde_json::to_string(model).map_err(|e| StorageError::Corrupt(e.to_string()))?;

        conn.execute(
            "INSERT INTO models (service, version, trained_at, training_samples, features_json, model_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
             ON CONFLICT(service) DO UPDATE SET
                version = excluded.version,
                trained_at = excluded.trained_at,
                training_samples = excluded.training_samples,
                features_json = excluded.features_json,
                model_json = excluded.model_json,
                updated_at = excluded.updated_at",
            params![
                model.service,
                model.info.version,
                encode_time(&model.info.trained_at),
                model.info.training_samples as i64,
                features_json,
                model_json,
            ],
        )?;

        info!(
            service = %model.service,
            version = %model.info.version,
            samples = model.info.training_samples,
            "saved model"
        );
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<SavedModel>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT service, model_json FROM models ORDER BY service")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut models = Vec::new();
        for r in rows {
            let (service, json) = r?;
            match serde_json::from_str::<SavedModel>(&json) {
                Ok(m) => models.push(m),
                Err(e) => warn!(%service, error = %e, "skipping unreadable saved model"),
            }
        }
        Ok(models)
    }

    fn load(&self, service: &str) -> Result<Option<SavedModel>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT model_json FROM models WHERE service = ?1")?;
        let mut rows = stmt.query(params![service])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let json: String = row.get(0)?;
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| StorageError::Corrupt(format!("model for {service}: {e}")))
    }
}
