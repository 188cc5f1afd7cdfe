use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::{
    database_or_default, decode_model, default_true, encode_model, refresh, split_id, Resource,
};
use crate::client::version::{Feature, ServerVersion};
use crate::client::Client;
use crate::schema::{AttrType, Attribute, Block};
use crate::sql::{self, ident};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Schema {
    pub id: Option<String>,
    pub name: String,
    pub database: Option<String>,
    pub owner: Option<String>,
    #[serde(default = "default_true")]
    pub if_not_exists: bool,
    pub drop_cascade: bool,
}

pub struct SchemaResource;

#[async_trait]
impl Resource for SchemaResource {
    fn type_name(&self) -> &'static str {
        "postgresql_schema"
    }

    fn schema(&self) -> Block {
        Block::resource(
            "A schema inside a PostgreSQL database.",
            vec![
                Attribute::required("name", AttrType::String),
                Attribute::optional_computed("database", AttrType::String)
                    .force_new()
                    .describe("Database holding the schema; the provider database when unset"),
                Attribute::optional_computed("owner", AttrType::String),
                Attribute::with_default("if_not_exists", AttrType::Bool, json!(true)),
                Attribute::with_default("drop_cascade", AttrType::Bool, json!(false))
                    .describe("Drop every object in the schema on delete"),
            ],
        )
    }

    async fn create(&self, client: &Client, planned: &Value) -> Result<Value> {
        let schema: Schema = decode_model(planned)?;
        let database = database_or_default(client, &schema.database).to_string();
        let version = client.version().await?;
        let session = client.session().await?;

        let mut tx = client.begin(Some(&database)).await?;
        let membership = match &schema.owner {
            Some(owner) => sql::ensure_membership(&mut tx, session, owner).await?,
            None => None,
        };
        let skip = schema.if_not_exists
            && !version.supports(Feature::SchemaCreateIfNotExists)
            && sql::schema_exists(&mut tx, &schema.name).await?;
        if !skip {
            sql::exec(&mut tx, &create_statement(&schema, version))
                .await
                .with_context(|| format!("Failed to create schema {:?}", schema.name))?;
        }
        sql::release_membership(&mut tx, session, membership).await?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit schema {:?}", schema.name))?;

        info!(schema = %schema.name, database = %database, "Created schema");
        let state = Schema {
            id: Some(format!("{}.{}", database, schema.name)),
            database: Some(database),
            ..schema
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn read(&self, client: &Client, state: &Value) -> Result<Option<Value>> {
        let prior: Schema = decode_model(state)?;
        let database = database_or_default(client, &prior.database).to_string();
        let mut conn = client.acquire(Some(&database)).await?;
        let owner: Option<String> = sqlx::query_scalar(
            "SELECT pg_catalog.pg_get_userbyid(nspowner)::text \
             FROM pg_catalog.pg_namespace WHERE nspname = $1",
        )
        .bind(&prior.name)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("Failed to read schema {:?}", prior.name))?;

        let Some(owner) = owner else {
            return Ok(None);
        };
        let current = Schema {
            id: Some(format!("{}.{}", database, prior.name)),
            database: Some(database),
            owner: Some(owner),
            ..prior
        };
        Ok(Some(encode_model(&current)?))
    }

    async fn update(&self, client: &Client, prior: &Value, planned: &Value) -> Result<Value> {
        let old: Schema = decode_model(prior)?;
        let new: Schema = decode_model(planned)?;
        let database = database_or_default(client, &old.database).to_string();
        let session = client.session().await?;

        let mut tx = client.begin(Some(&database)).await?;
        let membership = match &old.owner {
            Some(owner) => sql::ensure_membership(&mut tx, session, owner).await?,
            None => None,
        };
        let new_owner_membership = match &new.owner {
            Some(owner) if old.owner.as_ref() != Some(owner) => {
                sql::ensure_membership(&mut tx, session, owner).await?
            }
            _ => None,
        };
        sql::exec_all(&mut tx, &update_statements(&old, &new))
            .await
            .with_context(|| format!("Failed to update schema {:?}", new.name))?;
        sql::release_membership(&mut tx, session, new_owner_membership).await?;
        sql::release_membership(&mut tx, session, membership).await?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit schema {:?}", new.name))?;

        let state = Schema {
            id: Some(format!("{}.{}", database, new.name)),
            database: Some(database),
            ..new
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn delete(&self, client: &Client, state: &Value) -> Result<()> {
        let schema: Schema = decode_model(state)?;
        let database = database_or_default(client, &schema.database).to_string();
        let session = client.session().await?;

        let mut tx = client.begin(Some(&database)).await?;
        let membership = match &schema.owner {
            Some(owner) => sql::ensure_membership(&mut tx, session, owner).await?,
            None => None,
        };
        sql::exec(&mut tx, &drop_statement(&schema.name, schema.drop_cascade))
            .await
            .with_context(|| format!("Failed to drop schema {:?}", schema.name))?;
        sql::release_membership(&mut tx, session, membership).await?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit drop of schema {:?}", schema.name))?;
        info!(schema = %schema.name, database = %database, "Dropped schema");
        Ok(())
    }

    async fn exists(&self, client: &Client, state: &Value) -> Result<bool> {
        let schema: Schema = decode_model(state)?;
        let database = database_or_default(client, &schema.database).to_string();
        let mut conn = client.acquire(None).await?;
        if !sql::database_exists(&mut conn, &database).await? {
            return Ok(false);
        }
        let mut conn = client.acquire(Some(&database)).await?;
        sql::schema_exists(&mut conn, &schema.name).await
    }

    fn import_state(&self, id: &str) -> Result<Value> {
        let parts = split_id(id, '.', 2, "<database>.<schema>")?;
        Ok(json!({ "id": id, "database": parts[0], "name": parts[1] }))
    }
}

pub fn create_statement(schema: &Schema, version: ServerVersion) -> String {
    let mut statement = String::from("CREATE SCHEMA ");
    if schema.if_not_exists && version.supports(Feature::SchemaCreateIfNotExists) {
        statement.push_str("IF NOT EXISTS ");
    }
    statement.push_str(&ident(&schema.name));
    if let Some(owner) = &schema.owner {
        statement.push_str(" AUTHORIZATION ");
        statement.push_str(&ident(owner));
    }
    statement
}

pub fn update_statements(old: &Schema, new: &Schema) -> Vec<String> {
    let mut statements = Vec::new();
    if old.name != new.name {
        statements.push(format!(
            "ALTER SCHEMA {} RENAME TO {}",
            ident(&old.name),
            ident(&new.name)
        ));
    }
    if let Some(owner) = &new.owner {
        if old.owner.as_ref() != Some(owner) {
            statements.push(format!(
                "ALTER SCHEMA {} OWNER TO {}",
                ident(&new.name),
                ident(owner)
            ));
        }
    }
    statements
}

pub fn drop_statement(name: &str, cascade: bool) -> String {
    format!(
        "DROP SCHEMA {} {}",
        ident(name),
        if cascade { "CASCADE" } else { "RESTRICT" }
    )
}
