pub mod cron_job;
pub mod database;
pub mod default_privileges;
pub mod extension;
pub mod foreign_server;
pub mod grant;
pub mod grant_role;
pub mod privileges;
pub mod publication;
pub mod replication_slot;
pub mod role;
pub mod schema;
pub mod user_mapping;
pub mod view;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::client::Client;
use crate::error::ProviderError;
use crate::plugin::diagnostics::Finding;
use crate::schema::Block;

/// A Terraform resource type backed by PostgreSQL catalog objects.
///
/// State values handed in and out are JSON objects shaped by [`Resource::schema`].
/// `read` returns `None` when the object no longer exists, which removes it
/// from Terraform state.
#[async_trait]
pub trait Resource: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn schema(&self) -> Block;

    /// Checks that need no database. Unknown values arrive as null.
    fn validate(&self, _config: &Value) -> Vec<Finding> {
        vec![]
    }

    async fn create(&self, client: &Client, planned: &Value) -> Result<Value>;

    async fn read(&self, client: &Client, state: &Value) -> Result<Option<Value>>;

    async fn update(&self, client: &Client, prior: &Value, planned: &Value) -> Result<Value>;

    async fn delete(&self, client: &Client, state: &Value) -> Result<()>;

    /// Cheap existence check run before `read`.
    async fn exists(&self, client: &Client, state: &Value) -> Result<bool>;

    /// Initial state for `terraform import`; `read` fills in the rest.
    fn import_state(&self, id: &str) -> Result<Value>;
}

/// Every resource type served by the provider.
pub fn all() -> Vec<Box<dyn Resource>> {
    vec![
        Box::new(database::DatabaseResource),
        Box::new(role::RoleResource),
        Box::new(schema::SchemaResource),
        Box::new(extension::ExtensionResource),
        Box::new(view::ViewResource),
        Box::new(grant::GrantResource),
        Box::new(grant_role::GrantRoleResource),
        Box::new(default_privileges::DefaultPrivilegesResource),
        Box::new(publication::PublicationResource),
        Box::new(foreign_server::ForeignServerResource),
        Box::new(user_mapping::UserMappingResource),
        Box::new(replication_slot::LogicalSlotResource),
        Box::new(replication_slot::PhysicalSlotResource),
        Box::new(cron_job::CronJobResource),
    ]
}

// ─── State Helpers ───────────────────────────────────────────────────────────

/// Decode a state or config object into a model. Null attributes are treated
/// as absent so models can rely on `#[serde(default)]`.
pub fn decode_model<T: DeserializeOwned>(value: &Value) -> Result<T> {
    let stripped = match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(stripped).context("Failed to decode resource attributes")
}

pub fn encode_model<T: Serialize>(model: &T) -> Result<Value> {
    serde_json::to_value(model).context("Failed to encode resource attributes")
}

/// Split an import ID into exactly `parts` pieces on `sep`.
pub fn split_id<'a>(
    id: &'a str,
    sep: char,
    parts: usize,
    expected: &'static str,
) -> Result<Vec<&'a str>, ProviderError> {
    let pieces: Vec<&str> = id.splitn(parts, sep).collect();
    if pieces.len() != parts || pieces.iter().any(|p| p.is_empty()) {
        return Err(ProviderError::InvalidImportId {
            id: id.to_string(),
            expected,
        });
    }
    Ok(pieces)
}

/// Database a handler should work in: the configured one unless overridden.
pub fn database_or_default<'a>(client: &'a Client, database: &'a Option<String>) -> &'a str {
    database.as_deref().unwrap_or_else(|| client.default_database())
}

/// Re-read an object right after writing it so state mirrors the catalog.
pub async fn refresh<R: Resource + ?Sized>(resource: &R, client: &Client, state: &Value) -> Result<Value> {
    resource
        .read(client, state)
        .await?
        .with_context(|| format!("{} disappeared right after it was written", resource.type_name()))
}

pub(crate) fn default_true() -> bool {
    true
}

pub(crate) fn default_public() -> String {
    "public".to_string()
}
