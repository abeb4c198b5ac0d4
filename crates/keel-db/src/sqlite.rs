//! SQLite build store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::{BuildJob, BuildStore, Commit, GitProvider, Project, ResourceId, Result};
use sqlx::SqlitePool;

use crate::{DbError, DbResult};

/// A build record in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
struct BuildRecord {
    id: String,
    project: String,
    commit_info: String,
    status: String,
    enqueued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i64>,
    output: String,
    output_truncated: bool,
    error: Option<String>,
}

impl TryFrom<BuildRecord> for BuildJob {
    type Error = DbError;

    fn try_from(record: BuildRecord) -> DbResult<Self> {
        let id: ResourceId = record
            .id
            .parse()
            .map_err(|e| DbError::Corrupt(format!("build id {}: {}", record.id, e)))?;
        let commit: Commit = serde_json::from_str(&record.commit_info)?;
        let status = record
            .status
            .parse()
            .map_err(|e: String| DbError::Corrupt(format!("build {}: {}", id, e)))?;

        Ok(BuildJob {
            id,
            project: record.project,
            commit,
            enqueued_at: record.enqueued_at,
            status,
            started_at: record.started_at,
            finished_at: record.finished_at,
            output: record.output,
            output_truncated: record.output_truncated,
            exit_code: record.exit_code.map(|c| c as i32),
            error: record.error,
        })
    }
}

fn decode_project(config: Option<String>) -> DbResult<Option<Project>> {
    config
        .map(|c| serde_json::from_str(&c).map_err(DbError::from))
        .transpose()
}

/// SQLite implementation of [`BuildStore`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn upsert_project(&self, project: &Project) -> DbResult<()> {
        let config = serde_json::to_string(project)?;
        let mut tx = self.pool.begin().await?;

        // A repository belongs to one project at a time
        sqlx::query("DELETE FROM projects WHERE provider = $1 AND repository = $2 AND name <> $3")
            .bind(project.provider.as_str())
            .bind(&project.repository)
            .bind(&project.name)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO projects (name, provider, repository, config, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO UPDATE SET
                provider = excluded.provider,
                repository = excluded.repository,
                config = excluded.config,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&project.name)
        .bind(project.provider.as_str())
        .bind(&project.repository)
        .bind(config)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn fetch_project_by_name(&self, name: &str) -> DbResult<Option<Project>> {
        let config: Option<String> =
            sqlx::query_scalar("SELECT config FROM projects WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        decode_project(config)
    }

    async fn fetch_project_by_identity(
        &self,
        provider: GitProvider,
        identity: &str,
    ) -> DbResult<Option<Project>> {
        let config: Option<String> = sqlx::query_scalar(
            "SELECT config FROM projects WHERE provider = $1 AND repository = $2",
        )
        .bind(provider.as_str())
        .bind(identity)
        .fetch_optional(&self.pool)
        .await?;
        decode_project(config)
    }

    async fn upsert_build(&self, job: &BuildJob) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO builds (id, project, sha, branch, commit_info, status, enqueued_at,
                                started_at, finished_at, exit_code, output, output_truncated, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                status = excluded.status,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                exit_code = excluded.exit_code,
                output = excluded.output,
                output_truncated = excluded.output_truncated,
                error = excluded.error
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.project)
        .bind(&job.commit.sha)
        .bind(&job.commit.branch)
        .bind(serde_json::to_string(&job.commit)?)
        .bind(job.status.as_str())
        .bind(job.enqueued_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.exit_code.map(i64::from))
        .bind(&job.output)
        .bind(job.output_truncated)
        .bind(&job.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_build(&self, id: ResourceId) -> DbResult<Option<BuildJob>> {
        let record = sqlx::query_as::<_, BuildRecord>("SELECT * FROM builds WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        record.map(BuildJob::try_from).transpose()
    }

    async fn fetch_recent(&self, project: &str, limit: usize) -> DbResult<Vec<BuildJob>> {
        // UUIDv7 ids sort by creation time
        let records = sqlx::query_as::<_, BuildRecord>(
            "SELECT * FROM builds WHERE project = $1 ORDER BY id DESC LIMIT $2",
        )
        .bind(project)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(BuildJob::try_from).collect()
    }
}

#[async_trait]
impl BuildStore for SqliteStore {
    async fn save_project(&self, project: &Project) -> Result<()> {
        Ok(self.upsert_project(project).await?)
    }

    async fn load_project(&self, name: &str) -> Result<Option<Project>> {
        Ok(self.fetch_project_by_name(name).await?)
    }

    async fn load_project_by_repo_identity(
        &self,
        provider: GitProvider,
        identity: &str,
    ) -> Result<Option<Project>> {
        Ok(self.fetch_project_by_identity(provider, identity).await?)
    }

    async fn save_build(&self, job: &BuildJob) -> Result<()> {
        Ok(self.upsert_build(job).await?)
    }

    async fn load_build(&self, id: ResourceId) -> Result<Option<BuildJob>> {
        Ok(self.fetch_build(id).await?)
    }

    async fn load_recent_builds_for_project(
        &self,
        project: &str,
        limit: usize,
    ) -> Result<Vec<BuildJob>> {
        Ok(self.fetch_recent(project, limit).await?)
    }
}
