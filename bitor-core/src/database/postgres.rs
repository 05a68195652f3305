use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use uuid::Uuid;

use crate::domain::{
    Client, ExecutionLog, InteractServer, Job, JobId, Provider,
    ProviderCredential, ScanArchive, ScanProfile, TargetSet,
};
use crate::error::{BitorError, Result};
use crate::ports::{JobStore, RecordStore};

/// PostgreSQL implementation of both stores.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects and applies the embedded migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        crate::MIGRATOR.run(&pool).await.map_err(|e| {
            BitorError::persistence(format!("Failed to run migrations: {e}"))
        })?;
        Ok(Self::new(pool))
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn decode<T: DeserializeOwned>(value: Value, what: &str) -> Result<T> {
        serde_json::from_value(value).map_err(|e| {
            BitorError::persistence(format!("Invalid {what} payload: {e}"))
        })
    }

    async fn record_by_id<T: DeserializeOwned>(
        &self,
        table: &'static str,
        what: &str,
        id: &str,
    ) -> Result<T> {
        let sql = format!("SELECT record FROM {table} WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| BitorError::not_found(format!("{what} {id}")))?;
        Self::decode(row.try_get("record")?, what)
    }

    fn job_row(job: &Job) -> Result<Value> {
        Ok(serde_json::to_value(job)?)
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn get_job(&self, id: JobId) -> Result<Job> {
        let row = sqlx::query("SELECT record FROM scan_jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| BitorError::not_found(format!("scan {id}")))?;
        Self::decode(row.try_get("record")?, "scan")
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_jobs
                (id, status, cost, vm_start_time, vm_stop_time, created_at, record)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(job.id.0)
        .bind(job.status.as_str())
        .bind(job.cost)
        .bind(job.vm_start_time)
        .bind(job.vm_stop_time)
        .bind(job.created_at)
        .bind(Self::job_row(job)?)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET status = $2,
                cost = $3,
                vm_start_time = $4,
                vm_stop_time = $5,
                record = $6
            WHERE id = $1
            "#,
        )
        .bind(job.id.0)
        .bind(job.status.as_str())
        .bind(job.cost)
        .bind(job.vm_start_time)
        .bind(job.vm_stop_time)
        .bind(Self::job_row(job)?)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(BitorError::not_found(format!("scan {}", job.id)));
        }
        Ok(())
    }

    async fn load_log(&self, id: JobId) -> Result<ExecutionLog> {
        let row = sqlx::query("SELECT execution_log FROM scan_jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| BitorError::not_found(format!("scan {id}")))?;
        let blob: Option<Value> = row.try_get("execution_log")?;
        match blob {
            Some(value) => ExecutionLog::from_blob(&value.to_string()),
            None => Ok(ExecutionLog::new()),
        }
    }

    async fn store_log(&self, id: JobId, log: &ExecutionLog) -> Result<()> {
        let blob: Value = serde_json::from_str(&log.to_blob()?)?;
        let result =
            sqlx::query("UPDATE scan_jobs SET execution_log = $2 WHERE id = $1")
                .bind(id.0)
                .bind(blob)
                .execute(self.pool())
                .await?;
        if result.rows_affected() == 0 {
            return Err(BitorError::not_found(format!("scan {id}")));
        }
        Ok(())
    }

    async fn attach_results(
        &self,
        id: JobId,
        results: Vec<Value>,
    ) -> Result<usize> {
        let mut tx = self.pool().begin().await?;
        let count = results.len();
        for finding in results {
            sqlx::query("INSERT INTO scan_results (job_id, finding) VALUES ($1, $2)")
                .bind(id.0)
                .bind(finding)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(count)
    }

    async fn list_unpriced_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT record
            FROM scan_jobs
            WHERE cost IS NULL
              AND vm_start_time IS NOT NULL
              AND vm_stop_time IS NOT NULL
              AND status <> 'Manual'
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| -> Result<Job> {
                Self::decode(row.try_get("record")?, "scan")
            })
            .collect()
    }
}

#[async_trait]
impl RecordStore for PostgresStore {
    async fn get_profile(&self, id: &str) -> Result<ScanProfile> {
        self.record_by_id("scan_profiles", "scan profile", id).await
    }

    async fn get_client(&self, id: &str) -> Result<Client> {
        self.record_by_id("clients", "client", id).await
    }

    async fn get_targets(&self, id: &str) -> Result<TargetSet> {
        self.record_by_id("target_sets", "targets", id).await
    }

    async fn get_interact(&self, id: &str) -> Result<InteractServer> {
        self.record_by_id("interact_servers", "interact server", id)
            .await
    }

    async fn get_provider(&self, id: &str) -> Result<Provider> {
        self.record_by_id("providers", "provider", id).await
    }

    async fn provider_credentials(
        &self,
        provider_id: &str,
    ) -> Result<Vec<ProviderCredential>> {
        let rows = sqlx::query(
            r#"
            SELECT key_type, ciphertext
            FROM provider_credentials
            WHERE provider_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(provider_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| -> Result<ProviderCredential> {
                let key_type: String = row.try_get("key_type")?;
                Ok(ProviderCredential {
                    provider_id: provider_id.to_string(),
                    key_type: Self::decode(Value::String(key_type), "key type")?,
                    ciphertext: row.try_get("ciphertext")?,
                })
            })
            .collect()
    }

    async fn latest_archive(&self, job_id: JobId) -> Result<Option<ScanArchive>> {
        let row = sqlx::query(
            r#"
            SELECT id, job_id, client_id, provider_id, full_path, small_path, created
            FROM scan_archives
            WHERE job_id = $1
            ORDER BY created DESC
            LIMIT 1
            "#,
        )
        .bind(job_id.0)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| -> Result<ScanArchive> {
            let job_id: Uuid = row.try_get("job_id")?;
            Ok(ScanArchive {
                id: row.try_get("id")?,
                job_id: JobId(job_id),
                client_id: row.try_get("client_id")?,
                provider_id: row.try_get("provider_id")?,
                full_path: row.try_get("full_path")?,
                small_path: row.try_get("small_path")?,
                created: row.try_get("created")?,
            })
        })
        .transpose()
    }

    async fn insert_archive(&self, archive: &ScanArchive) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_archives
                (id, job_id, client_id, provider_id, full_path, small_path, created)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&archive.id)
        .bind(archive.job_id.0)
        .bind(&archive.client_id)
        .bind(&archive.provider_id)
        .bind(&archive.full_path)
        .bind(&archive.small_path)
        .bind(archive.created)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn encryption_sentinel(&self) -> Result<Option<String>> {
        let row =
            sqlx::query("SELECT encryption_sentinel FROM system_settings WHERE id = 1")
                .fetch_optional(self.pool())
                .await?;
        Ok(match row {
            Some(row) => row.try_get("encryption_sentinel")?,
            None => None,
        })
    }

    async fn store_encryption_sentinel(&self, ciphertext: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO system_settings (id, encryption_sentinel)
            VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE SET encryption_sentinel = EXCLUDED.encryption_sentinel
            "#,
        )
        .bind(ciphertext)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
