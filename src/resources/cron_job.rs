//! `postgresql_cron_job`: a job scheduled with the pg_cron extension.
//!
//! pg_cron lives in a single database (`cron_database`) and runs each job's
//! command in the job's own `database` as `username`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::{database_or_default, decode_model, default_true, encode_model, refresh, Resource};
use crate::client::Client;
use crate::error::ProviderError;
use crate::plugin::diagnostics::Finding;
use crate::schema::{AttrType, Attribute, Block};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CronJob {
    pub id: Option<String>,
    pub name: String,
    pub schedule: String,
    pub command: String,
    pub database: Option<String>,
    pub username: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    pub cron_database: Option<String>,
    pub job_id: Option<i64>,
}

impl CronJob {
    fn job_id(&self) -> Result<i64> {
        if let Some(id) = self.job_id {
            return Ok(id);
        }
        let id = self.id.as_deref().unwrap_or_default();
        id.parse::<i64>()
            .map_err(|_| ProviderError::InvalidImportId {
                id: id.to_string(),
                expected: "a numeric pg_cron job id",
            })
            .map_err(Into::into)
    }
}

pub struct CronJobResource;

#[async_trait]
impl Resource for CronJobResource {
    fn type_name(&self) -> &'static str {
        "postgresql_cron_job"
    }

    fn schema(&self) -> Block {
        Block::resource(
            "A pg_cron scheduled job.",
            vec![
                Attribute::required("name", AttrType::String).force_new(),
                Attribute::required("schedule", AttrType::String)
                    .describe("Cron expression, or an interval such as '30 seconds'"),
                Attribute::required("command", AttrType::String),
                Attribute::optional_computed("database", AttrType::String)
                    .describe("Database the command runs in"),
                Attribute::optional_computed("username", AttrType::String)
                    .describe("Role the command runs as"),
                Attribute::with_default("active", AttrType::Bool, json!(true)),
                Attribute::optional_computed("cron_database", AttrType::String)
                    .force_new()
                    .describe("Database where pg_cron is installed"),
                Attribute::computed("job_id", AttrType::Number),
            ],
        )
    }

    fn validate(&self, config: &Value) -> Vec<Finding> {
        let mut findings = Vec::new();
        for attr in ["name", "schedule", "command"] {
            if config
                .get(attr)
                .and_then(Value::as_str)
                .is_some_and(|v| v.trim().is_empty())
            {
                findings.push(Finding::error(format!("{} must not be empty", attr)).at(attr));
            }
        }
        findings
    }

    async fn create(&self, client: &Client, planned: &Value) -> Result<Value> {
        let job: CronJob = decode_model(planned)?;
        let cron_database = database_or_default(client, &job.cron_database).to_string();
        let database = database_or_default(client, &job.database).to_string();

        let mut conn = client.acquire(Some(&cron_database)).await?;
        let job_id: i64 = sqlx::query_scalar(
            "SELECT cron.schedule_in_database($1, $2, $3, $4, COALESCE($5, current_user::text), $6)",
        )
        .bind(&job.name)
        .bind(&job.schedule)
        .bind(&job.command)
        .bind(&database)
        .bind(job.username.as_deref())
        .bind(job.active)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("Failed to schedule cron job {:?}", job.name))?;

        info!(job = %job.name, job_id, database = %database, "Scheduled cron job");
        let state = CronJob {
            id: Some(job_id.to_string()),
            job_id: Some(job_id),
            cron_database: Some(cron_database),
            database: Some(database),
            ..job
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn read(&self, client: &Client, state: &Value) -> Result<Option<Value>> {
        let prior: CronJob = decode_model(state)?;
        let job_id = prior.job_id()?;
        let cron_database = database_or_default(client, &prior.cron_database).to_string();

        let mut conn = client.acquire(Some(&cron_database)).await?;
        type JobRow = (Option<String>, String, String, String, String, bool);
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT jobname::text, schedule, command, database, username, active \
             FROM cron.job WHERE jobid = $1",
        )
        .bind(job_id)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("Failed to read cron job {}", job_id))?;

        let Some((name, schedule, command, database, username, active)) = row else {
            return Ok(None);
        };
        let current = CronJob {
            id: Some(job_id.to_string()),
            name: name.unwrap_or_default(),
            schedule,
            command,
            database: Some(database),
            username: Some(username),
            active,
            cron_database: Some(cron_database),
            job_id: Some(job_id),
        };
        Ok(Some(encode_model(&current)?))
    }

    async fn update(&self, client: &Client, prior: &Value, planned: &Value) -> Result<Value> {
        let old: CronJob = decode_model(prior)?;
        let new: CronJob = decode_model(planned)?;
        let job_id = old.job_id()?;
        let cron_database = database_or_default(client, &old.cron_database).to_string();
        let database = database_or_default(client, &new.database).to_string();

        let mut conn = client.acquire(Some(&cron_database)).await?;
        sqlx::query("SELECT cron.alter_job($1, $2, $3, $4, $5, $6)")
            .bind(job_id)
            .bind(&new.schedule)
            .bind(&new.command)
            .bind(&database)
            .bind(new.username.as_deref())
            .bind(new.active)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("Failed to update cron job {}", job_id))?;

        let state = CronJob {
            id: Some(job_id.to_string()),
            job_id: Some(job_id),
            cron_database: Some(cron_database),
            database: Some(database),
            ..new
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn delete(&self, client: &Client, state: &Value) -> Result<()> {
        let job: CronJob = decode_model(state)?;
        let job_id = job.job_id()?;
        let cron_database = database_or_default(client, &job.cron_database).to_string();
        let mut conn = client.acquire(Some(&cron_database)).await?;
        sqlx::query("SELECT cron.unschedule($1::bigint)")
            .bind(job_id)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("Failed to unschedule cron job {}", job_id))?;
        info!(job_id, "Unscheduled cron job");
        Ok(())
    }

    async fn exists(&self, client: &Client, state: &Value) -> Result<bool> {
        Ok(self.read(client, state).await?.is_some())
    }

    fn import_state(&self, id: &str) -> Result<Value> {
        let job_id: i64 = id.parse().map_err(|_| ProviderError::InvalidImportId {
            id: id.to_string(),
            expected: "a numeric pg_cron job id",
        })?;
        Ok(json!({ "id": id, "job_id": job_id }))
    }
}
