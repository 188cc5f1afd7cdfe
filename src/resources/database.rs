use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{decode_model, default_true, encode_model, refresh, Resource};
use crate::client::version::{Feature, ServerVersion};
use crate::client::Client;
use crate::plugin::diagnostics::Finding;
use crate::schema::{AttrType, Attribute, Block};
use crate::sql::{self, ident, literal};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    pub id: Option<String>,
    pub name: String,
    pub owner: Option<String>,
    pub template: Option<String>,
    pub encoding: Option<String>,
    pub lc_collate: Option<String>,
    pub lc_ctype: Option<String>,
    pub tablespace_name: Option<String>,
    pub connection_limit: Option<i64>,
    #[serde(default = "default_true")]
    pub allow_connections: bool,
    pub is_template: bool,
    pub alter_object_ownership: bool,
}

pub struct DatabaseResource;

#[async_trait]
impl Resource for DatabaseResource {
    fn type_name(&self) -> &'static str {
        "postgresql_database"
    }

    fn schema(&self) -> Block {
        Block::resource(
            "A PostgreSQL database.",
            vec![
                Attribute::required("name", AttrType::String).describe("The database name"),
                Attribute::optional_computed("owner", AttrType::String)
                    .describe("Role that owns the database"),
                Attribute::optional_computed("template", AttrType::String)
                    .force_new()
                    .describe("Template database to copy from"),
                Attribute::optional_computed("encoding", AttrType::String)
                    .force_new()
                    .describe("Character set encoding"),
                Attribute::optional_computed("lc_collate", AttrType::String).force_new(),
                Attribute::optional_computed("lc_ctype", AttrType::String).force_new(),
                Attribute::optional_computed("tablespace_name", AttrType::String),
                Attribute::with_default("connection_limit", AttrType::Number, json!(-1))
                    .describe("Concurrent connections allowed, -1 for no limit"),
                Attribute::with_default("allow_connections", AttrType::Bool, json!(true)),
                Attribute::with_default("is_template", AttrType::Bool, json!(false)),
                Attribute::with_default("alter_object_ownership", AttrType::Bool, json!(false))
                    .describe("Reassign objects owned by the previous owner when owner changes"),
            ],
        )
    }

    fn validate(&self, config: &Value) -> Vec<Finding> {
        let mut findings = Vec::new();
        if let Some(limit) = config.get("connection_limit").and_then(Value::as_i64) {
            if limit < -1 {
                findings.push(
                    Finding::error("connection_limit must be -1 or greater").at("connection_limit"),
                );
            }
        }
        findings
    }

    async fn create(&self, client: &Client, planned: &Value) -> Result<Value> {
        let db: Database = decode_model(planned)?;
        let version = client.version().await?;
        let session = client.session().await?;
        let statement = create_statement(&db, version)?;

        // CREATE DATABASE refuses to run inside a transaction block.
        let mut conn = client.acquire(None).await?;
        let membership = match &db.owner {
            Some(owner) => sql::ensure_membership(&mut conn, session, owner).await?,
            None => None,
        };
        let created = sql::exec(&mut conn, &statement)
            .await
            .with_context(|| format!("Failed to create database {:?}", db.name));
        sql::release_membership(&mut conn, session, membership).await?;
        created?;

        info!(database = %db.name, "Created database");
        let state = Database {
            id: Some(db.name.clone()),
            ..db
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn read(&self, client: &Client, state: &Value) -> Result<Option<Value>> {
        let prior: Database = decode_model(state)?;
        let mut conn = client.acquire(None).await?;
        let row = sqlx::query_as::<_, (String, String, String, String, i32, String, bool, bool)>(
            "SELECT pg_catalog.pg_get_userbyid(d.datdba)::text, \
                    pg_catalog.pg_encoding_to_char(d.encoding)::text, \
                    d.datcollate::text, d.datctype::text, d.datconnlimit, \
                    t.spcname::text, d.datallowconn, d.datistemplate \
             FROM pg_catalog.pg_database d \
             JOIN pg_catalog.pg_tablespace t ON t.oid = d.dattablespace \
             WHERE d.datname = $1",
        )
        .bind(&prior.name)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("Failed to read database {:?}", prior.name))?;

        let Some((owner, encoding, collate, ctype, limit, tablespace, allow, is_template)) = row
        else {
            return Ok(None);
        };
        let current = Database {
            id: Some(prior.name.clone()),
            owner: Some(owner),
            encoding: Some(encoding),
            lc_collate: Some(collate),
            lc_ctype: Some(ctype),
            tablespace_name: Some(tablespace),
            connection_limit: Some(limit as i64),
            allow_connections: allow,
            is_template,
            // Not recorded in the catalog.
            template: prior.template.clone().or_else(|| Some("template0".to_string())),
            ..prior
        };
        Ok(Some(encode_model(&current)?))
    }

    async fn update(&self, client: &Client, prior: &Value, planned: &Value) -> Result<Value> {
        let old: Database = decode_model(prior)?;
        let new: Database = decode_model(planned)?;
        let version = client.version().await?;
        let session = client.session().await?;

        let mut conn = client.acquire(None).await?;
        for statement in update_statements(&old, &new, version)? {
            sql::exec(&mut conn, &statement)
                .await
                .with_context(|| format!("Failed to update database {:?}", new.name))?;
        }
        drop(conn);

        if let (Some(from), Some(to)) = (&old.owner, &new.owner) {
            if from != to && new.alter_object_ownership {
                // REASSIGN OWNED only touches the database it runs in.
                let mut tx = client.begin(Some(&new.name)).await?;
                let membership = sql::ensure_membership(&mut tx, session, from).await?;
                sql::exec(
                    &mut tx,
                    &format!("REASSIGN OWNED BY {} TO {}", ident(from), ident(to)),
                )
                .await?;
                sql::release_membership(&mut tx, session, membership).await?;
                tx.commit()
                    .await
                    .with_context(|| format!("Failed to reassign objects in {:?}", new.name))?;
            }
        }

        let state = Database {
            id: Some(new.name.clone()),
            ..new
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn delete(&self, client: &Client, state: &Value) -> Result<()> {
        let db: Database = decode_model(state)?;
        let version = client.version().await?;
        let session = client.session().await?;
        let mut conn = client.acquire(None).await?;

        let membership = match &db.owner {
            Some(owner) => sql::ensure_membership(&mut conn, session, owner).await?,
            None => None,
        };

        let result = async {
            if db.is_template {
                sql::exec(
                    &mut conn,
                    &format!("ALTER DATABASE {} IS_TEMPLATE false", ident(&db.name)),
                )
                .await?;
            }
            if version.supports(Feature::ForceDropDatabase) {
                sql::exec(&mut conn, &drop_statement(&db.name, true)).await
            } else {
                if version.supports(Feature::DatabaseAllowConnections) {
                    sql::exec(
                        &mut conn,
                        &format!("ALTER DATABASE {} ALLOW_CONNECTIONS false", ident(&db.name)),
                    )
                    .await?;
                }
                let terminated: Vec<bool> = sqlx::query_scalar(
                    "SELECT pg_catalog.pg_terminate_backend(pid) FROM pg_catalog.pg_stat_activity \
                     WHERE datname = $1 AND pid <> pg_catalog.pg_backend_pid()",
                )
                .bind(&db.name)
                .fetch_all(&mut *conn)
                .await
                .context("Failed to terminate sessions")?;
                if !terminated.is_empty() {
                    warn!(database = %db.name, sessions = terminated.len(), "Terminated open sessions");
                }
                sql::exec(&mut conn, &drop_statement(&db.name, false)).await
            }
        }
        .await
        .with_context(|| format!("Failed to drop database {:?}", db.name));

        if membership.is_some() {
            // Dropping the database can race with the role going away; ignore
            // failures revoking membership once the database is gone.
            if let Err(e) = sql::release_membership(&mut conn, session, membership).await {
                warn!(error = %e, "Failed to revoke temporary membership");
            }
        }
        result?;
        info!(database = %db.name, "Dropped database");
        Ok(())
    }

    async fn exists(&self, client: &Client, state: &Value) -> Result<bool> {
        let db: Database = decode_model(state)?;
        let mut conn = client.acquire(None).await?;
        sql::database_exists(&mut conn, &db.name).await
    }

    fn import_state(&self, id: &str) -> Result<Value> {
        Ok(json!({ "id": id, "name": id }))
    }
}

/// `CREATE DATABASE` with every option the model sets.
pub fn create_statement(db: &Database, version: ServerVersion) -> Result<String> {
    let mut statement = format!("CREATE DATABASE {}", ident(&db.name));
    let mut options = Vec::new();
    if let Some(owner) = &db.owner {
        version.require(Feature::DatabaseOwnerRole)?;
        options.push(format!("OWNER {}", ident(owner)));
    }
    if let Some(template) = &db.template {
        options.push(format!("TEMPLATE {}", ident(template)));
    }
    if let Some(encoding) = &db.encoding {
        options.push(format!("ENCODING {}", literal(encoding)));
    }
    if let Some(collate) = &db.lc_collate {
        options.push(format!("LC_COLLATE {}", literal(collate)));
    }
    if let Some(ctype) = &db.lc_ctype {
        options.push(format!("LC_CTYPE {}", literal(ctype)));
    }
    if let Some(tablespace) = &db.tablespace_name {
        options.push(format!("TABLESPACE {}", ident(tablespace)));
    }
    if let Some(limit) = db.connection_limit {
        options.push(format!("CONNECTION LIMIT {}", limit));
    }
    if version.supports(Feature::DatabaseAllowConnections) {
        options.push(format!("ALLOW_CONNECTIONS {}", db.allow_connections));
    } else if !db.allow_connections {
        version.require(Feature::DatabaseAllowConnections)?;
    }
    if version.supports(Feature::DatabaseIsTemplate) {
        options.push(format!("IS_TEMPLATE {}", db.is_template));
    } else if db.is_template {
        version.require(Feature::DatabaseIsTemplate)?;
    }
    if !options.is_empty() {
        statement.push_str(" WITH ");
        statement.push_str(&options.join(" "));
    }
    Ok(statement)
}

/// Statements moving `old` to `new`, rename first so later ones use the new name.
pub fn update_statements(
    old: &Database,
    new: &Database,
    version: ServerVersion,
) -> Result<Vec<String>> {
    let mut statements = Vec::new();
    let name = ident(&new.name);
    if old.name != new.name {
        statements.push(format!(
            "ALTER DATABASE {} RENAME TO {}",
            ident(&old.name),
            name
        ));
    }
    if let Some(owner) = &new.owner {
        if old.owner.as_ref() != Some(owner) {
            statements.push(format!("ALTER DATABASE {} OWNER TO {}", name, ident(owner)));
        }
    }
    if let Some(limit) = new.connection_limit {
        if old.connection_limit != Some(limit) {
            statements.push(format!(
                "ALTER DATABASE {} CONNECTION LIMIT = {}",
                name, limit
            ));
        }
    }
    if old.allow_connections != new.allow_connections {
        version.require(Feature::DatabaseAllowConnections)?;
        statements.push(format!(
            "ALTER DATABASE {} ALLOW_CONNECTIONS {}",
            name, new.allow_connections
        ));
    }
    if old.is_template != new.is_template {
        version.require(Feature::DatabaseIsTemplate)?;
        statements.push(format!(
            "ALTER DATABASE {} IS_TEMPLATE {}",
            name, new.is_template
        ));
    }
    if let Some(tablespace) = &new.tablespace_name {
        if old.tablespace_name.as_ref() != Some(tablespace) {
            statements.push(format!(
                "ALTER DATABASE {} SET TABLESPACE {}",
                name,
                ident(tablespace)
            ));
        }
    }
    Ok(statements)
}

pub fn drop_statement(name: &str, force: bool) -> String {
    if force {
        format!("DROP DATABASE {} WITH (FORCE)", ident(name))
    } else {
        format!("DROP DATABASE {}", ident(name))
    }
}
