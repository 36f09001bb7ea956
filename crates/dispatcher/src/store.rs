//! Persistence seams used by the dispatcher, with their PostgreSQL implementation.
//!
//! Jobs are stored in `notification_jobs`, their recipients in
//! `notification_recipients` keyed by `(job_id, idx)` so list order survives
//! a round trip.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use relay_common::error::AppError;
use relay_common::types::{
    DocStatus, DocumentType, JobStatus, NotificationJob, Recipient, RecipientStatus, WechatApp,
};

use crate::documents::SourceDocument;

/// Load/save of notification jobs plus the bulk queries used by housekeeping.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load(&self, job_id: Uuid) -> Result<Option<NotificationJob>, AppError>;

    /// Insert or overwrite the job and all of its recipients.
    async fn save(&self, job: &NotificationJob) -> Result<(), AppError>;

    /// Ids of submitted `New` jobs created after `created_after`.
    async fn list_dispatchable(&self, created_after: DateTime<Utc>) -> Result<Vec<Uuid>, AppError>;

    /// Delete jobs and recipients created before `cutoff`. Returns deleted jobs.
    async fn purge_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError>;
}

#[async_trait]
pub trait AppDirectory: Send + Sync {
    async fn get_app(&self, name: &str) -> Result<Option<WechatApp>, AppError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document(
        &self,
        document_type: DocumentType,
        document_id: &str,
    ) -> Result<Option<SourceDocument>, AppError>;
}

#[async_trait]
pub trait BindingDirectory: Send + Sync {
    /// The user's openid within `app`, if they have bound their account.
    async fn openid(&self, app: &str, user_ref: &str) -> Result<Option<String>, AppError>;
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    app: String,
    document_type: DocumentType,
    document_id: String,
    status: JobStatus,
    doc_status: DocStatus,
    error_info: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct RecipientRow {
    user_ref: String,
    sent: bool,
    status: RecipientStatus,
    info: Option<String>,
}

/// PostgreSQL-backed implementation of every store seam.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn load(&self, job_id: Uuid) -> Result<Option<NotificationJob>, AppError> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            SELECT id, app, document_type, document_id, status, doc_status, error_info, created_at
            FROM notification_jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let recipients: Vec<RecipientRow> = sqlx::query_as(
            r#"
            SELECT user_ref, sent, status, info
            FROM notification_recipients
            WHERE job_id = $1
            ORDER BY idx
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(NotificationJob {
            id: row.id,
            app: row.app,
            document_type: row.document_type,
            document_id: row.document_id,
            recipients: recipients
                .into_iter()
                .map(|r| Recipient {
                    user_ref: r.user_ref,
                    sent: r.sent,
                    status: r.status,
                    info: r.info,
                })
                .collect(),
            status: row.status,
            doc_status: row.doc_status,
            error_info: row.error_info,
            created_at: row.created_at,
        }))
    }

    async fn save(&self, job: &NotificationJob) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO notification_jobs (id, app, document_type, document_id, status, doc_status, error_info, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                doc_status = EXCLUDED.doc_status,
                error_info = EXCLUDED.error_info,
                updated_at = NOW()
            "#,
        )
        .bind(job.id)
        .bind(&job.app)
        .bind(job.document_type)
        .bind(&job.document_id)
        .bind(job.status)
        .bind(job.doc_status)
        .bind(&job.error_info)
        .bind(job.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM notification_recipients WHERE job_id = $1")
            .bind(job.id)
            .execute(&mut *tx)
            .await?;

        for (idx, recipient) in job.recipients.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO notification_recipients (job_id, idx, user_ref, sent, status, info, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(job.id)
            .bind(idx as i32)
            .bind(&recipient.user_ref)
            .bind(recipient.sent)
            .bind(recipient.status)
            .bind(&recipient.info)
            .bind(job.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!(job_id = %job.id, status = %job.status, "Job saved");
        Ok(())
    }

    async fn list_dispatchable(&self, created_after: DateTime<Utc>) -> Result<Vec<Uuid>, AppError> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM notification_jobs
            WHERE status = $1 AND doc_status = $2 AND created_at > $3
            ORDER BY created_at
            "#,
        )
        .bind(JobStatus::New)
        .bind(DocStatus::Submitted)
        .bind(created_after)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn purge_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let mut tx = self.pool.begin().await?;

        let recipients = sqlx::query("DELETE FROM notification_recipients WHERE created_at < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let jobs = sqlx::query("DELETE FROM notification_jobs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        tracing::info!(jobs, recipients, cutoff = %cutoff, "Purged aged notification jobs");
        Ok(jobs)
    }
}

#[async_trait]
impl AppDirectory for PgStore {
    async fn get_app(&self, name: &str) -> Result<Option<WechatApp>, AppError> {
        let app: Option<WechatApp> = sqlx::query_as(
            r#"
            SELECT name, app_id, secret, domain, language, device_alarm_template, tickets_ticket_template
            FROM wechat_apps
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(app)
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn get_document(
        &self,
        document_type: DocumentType,
        document_id: &str,
    ) -> Result<Option<SourceDocument>, AppError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT payload FROM source_documents WHERE document_type = $1 AND document_id = $2",
        )
        .bind(document_type)
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(payload,)| {
            SourceDocument::from_payload(document_type, payload).map_err(|e| {
                AppError::Internal(format!(
                    "Malformed {} document {}: {}",
                    document_type, document_id, e
                ))
            })
        })
        .transpose()
    }
}

#[async_trait]
impl BindingDirectory for PgStore {
    async fn openid(&self, app: &str, user_ref: &str) -> Result<Option<String>, AppError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT openid FROM wechat_bindings WHERE app = $1 AND user_ref = $2")
                .bind(app)
                .bind(user_ref)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(openid,)| openid).filter(|o| !o.is_empty()))
    }
}
