//! Logical and physical replication slots.
//!
//! Slots are created and dropped through the server's admin functions rather
//! than DDL, and neither kind can be altered; every attribute forces
//! replacement.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::{database_or_default, decode_model, encode_model, refresh, Resource};
use crate::client::version::Feature;
use crate::client::Client;
use crate::schema::{AttrType, Attribute, Block};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogicalSlot {
    pub id: Option<String>,
    pub name: String,
    pub plugin: String,
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicalSlot {
    pub id: Option<String>,
    pub name: String,
}

pub struct LogicalSlotResource;

#[async_trait]
impl Resource for LogicalSlotResource {
    fn type_name(&self) -> &'static str {
        "postgresql_replication_slot"
    }

    fn schema(&self) -> Block {
        Block::resource(
            "A logical replication slot.",
            vec![
                Attribute::required("name", AttrType::String).force_new(),
                Attribute::required("plugin", AttrType::String)
                    .force_new()
                    .describe("Output plugin, e.g. pgoutput or test_decoding"),
                Attribute::optional_computed("database", AttrType::String).force_new(),
            ],
        )
    }

    async fn create(&self, client: &Client, planned: &Value) -> Result<Value> {
        let slot: LogicalSlot = decode_model(planned)?;
        client.version().await?.require(Feature::ReplicationSlots)?;
        let database = database_or_default(client, &slot.database).to_string();

        // Logical slots belong to the database of the creating session.
        let mut conn = client.acquire(Some(&database)).await?;
        sqlx::query("SELECT pg_catalog.pg_create_logical_replication_slot($1, $2)")
            .bind(&slot.name)
            .bind(&slot.plugin)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("Failed to create replication slot {:?}", slot.name))?;

        info!(slot = %slot.name, plugin = %slot.plugin, database = %database, "Created logical replication slot");
        let state = LogicalSlot {
            id: Some(slot.name.clone()),
            database: Some(database),
            ..slot
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn read(&self, client: &Client, state: &Value) -> Result<Option<Value>> {
        let prior: LogicalSlot = decode_model(state)?;
        let mut conn = client.acquire(None).await?;
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT plugin::text, database::text FROM pg_catalog.pg_replication_slots \
             WHERE slot_name = $1 AND slot_type = 'logical'",
        )
        .bind(&prior.name)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("Failed to read replication slot {:?}", prior.name))?;

        let Some((plugin, database)) = row else {
            return Ok(None);
        };
        let current = LogicalSlot {
            id: Some(prior.name.clone()),
            plugin,
            database: Some(database),
            ..prior
        };
        Ok(Some(encode_model(&current)?))
    }

    async fn update(&self, client: &Client, _prior: &Value, planned: &Value) -> Result<Value> {
        refresh(self, client, planned).await
    }

    async fn delete(&self, client: &Client, state: &Value) -> Result<()> {
        let slot: LogicalSlot = decode_model(state)?;
        drop_slot(client, &slot.name).await
    }

    async fn exists(&self, client: &Client, state: &Value) -> Result<bool> {
        Ok(self.read(client, state).await?.is_some())
    }

    fn import_state(&self, id: &str) -> Result<Value> {
        Ok(json!({ "id": id, "name": id }))
    }
}

pub struct PhysicalSlotResource;

#[async_trait]
impl Resource for PhysicalSlotResource {
    fn type_name(&self) -> &'static str {
        "postgresql_physical_replication_slot"
    }

    fn schema(&self) -> Block {
        Block::resource(
            "A physical replication slot.",
            vec![Attribute::required("name", AttrType::String).force_new()],
        )
    }

    async fn create(&self, client: &Client, planned: &Value) -> Result<Value> {
        let slot: PhysicalSlot = decode_model(planned)?;
        client.version().await?.require(Feature::ReplicationSlots)?;

        let mut conn = client.acquire(None).await?;
        sqlx::query("SELECT pg_catalog.pg_create_physical_replication_slot($1)")
            .bind(&slot.name)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("Failed to create replication slot {:?}", slot.name))?;

        info!(slot = %slot.name, "Created physical replication slot");
        let state = PhysicalSlot {
            id: Some(slot.name.clone()),
            ..slot
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn read(&self, client: &Client, state: &Value) -> Result<Option<Value>> {
        let prior: PhysicalSlot = decode_model(state)?;
        let mut conn = client.acquire(None).await?;
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_replication_slots \
             WHERE slot_name = $1 AND slot_type = 'physical')",
        )
        .bind(&prior.name)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("Failed to read replication slot {:?}", prior.name))?;

        if !exists {
            return Ok(None);
        }
        Ok(Some(encode_model(&PhysicalSlot {
            id: Some(prior.name.clone()),
            ..prior
        })?))
    }

    async fn update(&self, client: &Client, _prior: &Value, planned: &Value) -> Result<Value> {
        refresh(self, client, planned).await
    }

    async fn delete(&self, client: &Client, state: &Value) -> Result<()> {
        let slot: PhysicalSlot = decode_model(state)?;
        drop_slot(client, &slot.name).await
    }

    async fn exists(&self, client: &Client, state: &Value) -> Result<bool> {
        Ok(self.read(client, state).await?.is_some())
    }

    fn import_state(&self, id: &str) -> Result<Value> {
        Ok(json!({ "id": id, "name": id }))
    }
}

async fn drop_slot(client: &Client, name: &str) -> Result<()> {
    let mut conn = client.acquire(None).await?;
    sqlx::query(
        "SELECT pg_catalog.pg_drop_replication_slot(slot_name) \
         FROM pg_catalog.pg_replication_slots WHERE slot_name = $1",
    )
    .bind(name)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("Failed to drop replication slot {:?}", name))?;
    info!(slot = %name, "Dropped replication slot");
    Ok(())
}
