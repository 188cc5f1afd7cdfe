use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::{database_or_default, decode_model, encode_model, refresh, split_id, Resource};
use crate::client::version::Feature;
use crate::client::Client;
use crate::schema::{AttrType, Attribute, Block};
use crate::sql::{self, ident, literal};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Extension {
    pub id: Option<String>,
    pub name: String,
    pub schema: Option<String>,
    pub version: Option<String>,
    pub database: Option<String>,
    pub drop_cascade: bool,
    pub create_cascade: bool,
}

pub struct ExtensionResource;

#[async_trait]
impl Resource for ExtensionResource {
    fn type_name(&self) -> &'static str {
        "postgresql_extension"
    }

    fn schema(&self) -> Block {
        Block::resource(
            "An extension installed in a PostgreSQL database.",
            vec![
                Attribute::required("name", AttrType::String).force_new(),
                Attribute::optional_computed("schema", AttrType::String)
                    .describe("Schema to install the extension's objects into"),
                Attribute::optional_computed("version", AttrType::String),
                Attribute::optional_computed("database", AttrType::String).force_new(),
                Attribute::with_default("drop_cascade", AttrType::Bool, json!(false)),
                Attribute::with_default("create_cascade", AttrType::Bool, json!(false))
                    .describe("Install missing dependencies as well"),
            ],
        )
    }

    async fn create(&self, client: &Client, planned: &Value) -> Result<Value> {
        let ext: Extension = decode_model(planned)?;
        client.version().await?.require(Feature::Extension)?;
        let database = database_or_default(client, &ext.database).to_string();

        let mut tx = client.begin(Some(&database)).await?;
        sql::exec(&mut tx, &create_statement(&ext))
            .await
            .with_context(|| format!("Failed to create extension {:?}", ext.name))?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit extension {:?}", ext.name))?;

        info!(extension = %ext.name, database = %database, "Created extension");
        let state = Extension {
            id: Some(format!("{}.{}", database, ext.name)),
            database: Some(database),
            ..ext
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn read(&self, client: &Client, state: &Value) -> Result<Option<Value>> {
        let prior: Extension = decode_model(state)?;
        let database = database_or_default(client, &prior.database).to_string();
        let mut conn = client.acquire(Some(&database)).await?;
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT n.nspname::text, e.extversion \
             FROM pg_catalog.pg_extension e \
             JOIN pg_catalog.pg_namespace n ON n.oid = e.extnamespace \
             WHERE e.extname = $1",
        )
        .bind(&prior.name)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("Failed to read extension {:?}", prior.name))?;

        let Some((schema, version)) = row else {
            return Ok(None);
        };
        let current = Extension {
            id: Some(format!("{}.{}", database, prior.name)),
            database: Some(database),
            schema: Some(schema),
            version: Some(version),
            ..prior
        };
        Ok(Some(encode_model(&current)?))
    }

    async fn update(&self, client: &Client, prior: &Value, planned: &Value) -> Result<Value> {
        let old: Extension = decode_model(prior)?;
        let new: Extension = decode_model(planned)?;
        let database = database_or_default(client, &old.database).to_string();

        let mut tx = client.begin(Some(&database)).await?;
        sql::exec_all(&mut tx, &update_statements(&old, &new))
            .await
            .with_context(|| format!("Failed to update extension {:?}", new.name))?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit extension {:?}", new.name))?;

        let state = Extension {
            id: Some(format!("{}.{}", database, new.name)),
            database: Some(database),
            ..new
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn delete(&self, client: &Client, state: &Value) -> Result<()> {
        let ext: Extension = decode_model(state)?;
        let database = database_or_default(client, &ext.database).to_string();
        let mut tx = client.begin(Some(&database)).await?;
        sql::exec(&mut tx, &drop_statement(&ext.name, ext.drop_cascade))
            .await
            .with_context(|| format!("Failed to drop extension {:?}", ext.name))?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit drop of extension {:?}", ext.name))?;
        info!(extension = %ext.name, database = %database, "Dropped extension");
        Ok(())
    }

    async fn exists(&self, client: &Client, state: &Value) -> Result<bool> {
        let ext: Extension = decode_model(state)?;
        let database = database_or_default(client, &ext.database).to_string();
        let mut conn = client.acquire(None).await?;
        if !sql::database_exists(&mut conn, &database).await? {
            return Ok(false);
        }
        let mut conn = client.acquire(Some(&database)).await?;
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_extension WHERE extname = $1)",
        )
        .bind(&ext.name)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("Failed to look up extension {:?}", ext.name))?;
        Ok(exists)
    }

    fn import_state(&self, id: &str) -> Result<Value> {
        let parts = split_id(id, '.', 2, "<database>.<extension>")?;
        Ok(json!({ "id": id, "database": parts[0], "name": parts[1] }))
    }
}

pub fn create_statement(ext: &Extension) -> String {
    let mut statement = format!("CREATE EXTENSION IF NOT EXISTS {}", ident(&ext.name));
    if let Some(schema) = &ext.schema {
        statement.push_str(&format!(" SCHEMA {}", ident(schema)));
    }
    if let Some(version) = &ext.version {
        statement.push_str(&format!(" VERSION {}", literal(version)));
    }
    if ext.create_cascade {
        statement.push_str(" CASCADE");
    }
    statement
}

pub fn update_statements(old: &Extension, new: &Extension) -> Vec<String> {
    let name = ident(&new.name);
    let mut statements = Vec::new();
    if let Some(schema) = &new.schema {
        if old.schema.as_ref() != Some(schema) {
            statements.push(format!("ALTER EXTENSION {} SET SCHEMA {}", name, ident(schema)));
        }
    }
    if old.version != new.version {
        statements.push(match &new.version {
            Some(version) => format!("ALTER EXTENSION {} UPDATE TO {}", name, literal(version)),
            None => format!("ALTER EXTENSION {} UPDATE", name),
        });
    }
    statements
}

pub fn drop_statement(name: &str, cascade: bool) -> String {
    let mut statement = format!("DROP EXTENSION IF EXISTS {}", ident(name));
    if cascade {
        statement.push_str(" CASCADE");
    }
    statement
}
