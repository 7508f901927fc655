//! sqlite-backed store.
//!
//! Timestamps are stored as RFC 3339 text and structured columns (metrics,
//! tags, experiment definitions) as JSON text, which keeps the schema small
//! and readable with the sqlite shell.

use super::ModelStore;
use crate::ab_testing::{Experiment, ExperimentResult};
use crate::error::{ModelOpsError, Result};
use crate::registry::{ModelStage, ModelVersion, NewModelVersion};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS model_sequences (
        model_name TEXT PRIMARY KEY,
        last_version INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS model_versions (
        model_name TEXT NOT NULL,
        version INTEGER NOT NULL,
        stage TEXT NOT NULL,
        created_at TEXT NOT NULL,
        metrics TEXT NOT NULL,
        tags TEXT NOT NULL,
        description TEXT,
        artifact_type TEXT NOT NULL,
        artifact_ref TEXT NOT NULL,
        PRIMARY KEY (model_name, version)
    )",
    "CREATE TABLE IF NOT EXISTS artifacts (
        model_name TEXT NOT NULL,
        version INTEGER NOT NULL,
        payload BLOB NOT NULL,
        PRIMARY KEY (model_name, version)
    )",
    "CREATE TABLE IF NOT EXISTS experiments (
        experiment_id TEXT PRIMARY KEY,
        model_type TEXT NOT NULL,
        status TEXT NOT NULL,
        definition TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS experiment_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        experiment_id TEXT NOT NULL,
        variant_name TEXT NOT NULL,
        request_id TEXT NOT NULL,
        recorded_at TEXT NOT NULL,
        success INTEGER NOT NULL,
        latency_ms REAL NOT NULL,
        metrics TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_experiment_results_experiment
        ON experiment_results (experiment_id)",
];

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and create the schema if needed. In-memory databases are
    /// pinned to a single long-lived connection, since every sqlite memory
    /// connection is its own database.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        let store = Self { pool };
        store.run_migrations().await?;

        info!(url = %url, in_memory, "🗄️ STORE: sqlite store ready");
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!(statements = SCHEMA.len(), "🗄️ STORE: schema ensured");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| ModelOpsError::Storage(format!("invalid timestamp '{raw}': {e}")))
}

fn to_db_version(version: u64) -> Result<i64> {
    i64::try_from(version)
        .map_err(|_| ModelOpsError::Validation(format!("version {version} is out of range")))
}

fn from_db_version(version: i64) -> Result<u64> {
    u64::try_from(version)
        .map_err(|_| ModelOpsError::Storage(format!("negative version {version} in store")))
}

fn version_from_row(row: &SqliteRow) -> Result<ModelVersion> {
    let stage: String = row.try_get("stage")?;
    let created_at: String = row.try_get("created_at")?;
    let metrics: String = row.try_get("metrics")?;
    let tags: String = row.try_get("tags")?;

    Ok(ModelVersion {
        model_name: row.try_get("model_name")?,
        version: from_db_version(row.try_get("version")?)?,
        stage: stage.parse::<ModelStage>()?,
        created_at: parse_timestamp(&created_at)?,
        metrics: serde_json::from_str(&metrics)?,
        tags: serde_json::from_str(&tags)?,
        description: row.try_get("description")?,
        artifact_type: row.try_get("artifact_type")?,
        artifact_ref: row.try_get("artifact_ref")?,
    })
}

fn result_from_row(row: &SqliteRow) -> Result<ExperimentResult> {
    let recorded_at: String = row.try_get("recorded_at")?;
    let metrics: String = row.try_get("metrics")?;
    let success: i64 = row.try_get("success")?;

    Ok(ExperimentResult {
        experiment_id: row.try_get("experiment_id")?,
        variant_name: row.try_get("variant_name")?,
        request_id: row.try_get("request_id")?,
        timestamp: parse_timestamp(&recorded_at)?,
        success: success != 0,
        latency_ms: row.try_get("latency_ms")?,
        metrics: serde_json::from_str(&metrics)?,
    })
}

const VERSION_COLUMNS: &str = "model_name, version, stage, created_at, metrics, tags, \
     description, artifact_type, artifact_ref";

#[async_trait]
impl ModelStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn health_check(&self) -> Result<()> {
        let row = sqlx::query("SELECT 1 AS health").fetch_one(&self.pool).await?;
        let health: i64 = row.try_get("health")?;
        if health == 1 {
            Ok(())
        } else {
            Err(ModelOpsError::Storage("sqlite health check failed".to_string()))
        }
    }

    async fn insert_version(
        &self,
        new_version: NewModelVersion,
        artifact: Option<Vec<u8>>,
    ) -> Result<ModelVersion> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO model_sequences (model_name, last_version) VALUES (?, 1)
             ON CONFLICT(model_name) DO UPDATE SET last_version = last_version + 1",
        )
        .bind(&new_version.model_name)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query("SELECT last_version FROM model_sequences WHERE model_name = ?")
            .bind(&new_version.model_name)
            .fetch_one(&mut *tx)
            .await?;
        let version = from_db_version(row.try_get("last_version")?)?;

        let record = ModelVersion {
            artifact_ref: ModelVersion::artifact_ref_for(&new_version.model_name, version),
            model_name: new_version.model_name,
            version,
            stage: ModelStage::None,
            created_at: new_version.created_at,
            metrics: new_version.metrics,
            tags: new_version.tags,
            description: new_version.description,
            artifact_type: new_version.artifact_type,
        };

        sqlx::query(&format!(
            "INSERT INTO model_versions ({VERSION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&record.model_name)
        .bind(to_db_version(record.version)?)
        .bind(record.stage.as_str())
        .bind(format_timestamp(&record.created_at))
        .bind(serde_json::to_string(&record.metrics)?)
        .bind(serde_json::to_string(&record.tags)?)
        .bind(&record.description)
        .bind(&record.artifact_type)
        .bind(&record.artifact_ref)
        .execute(&mut *tx)
        .await?;

        if let Some(payload) = artifact {
            sqlx::query("INSERT INTO artifacts (model_name, version, payload) VALUES (?, ?, ?)")
                .bind(&record.model_name)
                .bind(to_db_version(record.version)?)
                .bind(payload)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(record)
    }

    async fn get_version(&self, model_name: &str, version: u64) -> Result<Option<ModelVersion>> {
        let row = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM model_versions WHERE model_name = ? AND version = ?"
        ))
        .bind(model_name)
        .bind(to_db_version(version)?)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(version_from_row).transpose()
    }

    async fn list_versions(&self, model_name: &str) -> Result<Vec<ModelVersion>> {
        let rows = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM model_versions WHERE model_name = ?
             ORDER BY version DESC"
        ))
        .bind(model_name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(version_from_row).collect()
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT DISTINCT model_name FROM model_versions ORDER BY model_name")
                .fetch_all(&self.pool)
                .await?;

        rows.iter()
            .map(|row| -> Result<String> { Ok(row.try_get("model_name")?) })
            .collect()
    }

    async fn apply_stage_changes(
        &self,
        model_name: &str,
        changes: &[(u64, ModelStage)],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for (version, stage) in changes {
            let updated = sqlx::query(
                "UPDATE model_versions SET stage = ? WHERE model_name = ? AND version = ?",
            )
            .bind(stage.as_str())
            .bind(model_name)
            .bind(to_db_version(*version)?)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                // Dropping the transaction rolls back earlier updates
                return Err(ModelOpsError::NotFound(format!(
                    "model '{model_name}' version {version}"
                )));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_version(&self, model_name: &str, version: u64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let db_version = to_db_version(version)?;

        sqlx::query("DELETE FROM artifacts WHERE model_name = ? AND version = ?")
            .bind(model_name)
            .bind(db_version)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM model_versions WHERE model_name = ? AND version = ?")
            .bind(model_name)
            .bind(db_version)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn load_artifact(&self, model_name: &str, version: u64) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT payload FROM artifacts WHERE model_name = ? AND version = ?")
            .bind(model_name)
            .bind(to_db_version(version)?)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<Vec<u8>> { Ok(row.try_get("payload")?) })
            .transpose()
    }

    async fn save_experiment(&self, experiment: &Experiment) -> Result<()> {
        sqlx::query(
            "INSERT INTO experiments (experiment_id, model_type, status, definition, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(experiment_id) DO UPDATE SET
                model_type = excluded.model_type,
                status = excluded.status,
                definition = excluded.definition,
                updated_at = excluded.updated_at",
        )
        .bind(&experiment.experiment_id)
        .bind(&experiment.model_type)
        .bind(experiment.status.to_string())
        .bind(serde_json::to_string(experiment)?)
        .bind(format_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_experiment(&self, experiment_id: &str) -> Result<Option<Experiment>> {
        let row = sqlx::query("SELECT definition FROM experiments WHERE experiment_id = ?")
            .bind(experiment_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition: String = row.try_get("definition")?;
                Ok(Some(serde_json::from_str(&definition)?))
            }
            None => Ok(None),
        }
    }

    async fn list_experiments(&self) -> Result<Vec<Experiment>> {
        let rows = sqlx::query("SELECT definition FROM experiments ORDER BY experiment_id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<Experiment> {
                let definition: String = row.try_get("definition")?;
                Ok(serde_json::from_str(&definition)?)
            })
            .collect()
    }

    async fn append_results(&self, results: &[ExperimentResult]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for result in results {
            sqlx::query(
                "INSERT INTO experiment_results
                    (experiment_id, variant_name, request_id, recorded_at, success, latency_ms, metrics)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&result.experiment_id)
            .bind(&result.variant_name)
            .bind(&result.request_id)
            .bind(format_timestamp(&result.timestamp))
            .bind(i64::from(result.success))
            .bind(result.latency_ms)
            .bind(serde_json::to_string(&result.metrics)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_results(&self, experiment_id: &str) -> Result<Vec<ExperimentResult>> {
        let rows = sqlx::query(
            "SELECT experiment_id, variant_name, request_id, recorded_at, success, latency_ms, metrics
             FROM experiment_results WHERE experiment_id = ? ORDER BY id",
        )
        .bind(experiment_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(result_from_row).collect()
    }
}
