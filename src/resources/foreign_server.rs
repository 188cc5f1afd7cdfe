use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::{decode_model, encode_model, refresh, Resource};
use crate::client::Client;
use crate::schema::{AttrType, Attribute, Block};
use crate::sql::{self, ident, literal};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForeignServer {
    pub id: Option<String>,
    pub server_name: String,
    pub server_type: Option<String>,
    pub server_version: Option<String>,
    pub fdw_name: String,
    pub options: BTreeMap<String, String>,
    pub server_owner: Option<String>,
    pub drop_cascade: bool,
}

pub struct ForeignServerResource;

#[async_trait]
impl Resource for ForeignServerResource {
    fn type_name(&self) -> &'static str {
        "postgresql_server"
    }

    fn schema(&self) -> Block {
        Block::resource(
            "A foreign server for a foreign-data wrapper.",
            vec![
                Attribute::required("server_name", AttrType::String),
                Attribute::optional("server_type", AttrType::String).force_new(),
                Attribute::optional("server_version", AttrType::String),
                Attribute::required("fdw_name", AttrType::String)
                    .force_new()
                    .describe("Foreign-data wrapper that manages the server"),
                Attribute::optional("options", AttrType::map_of_strings()),
                Attribute::optional_computed("server_owner", AttrType::String),
                Attribute::with_default("drop_cascade", AttrType::Bool, json!(false)),
            ],
        )
    }

    async fn create(&self, client: &Client, planned: &Value) -> Result<Value> {
        let server: ForeignServer = decode_model(planned)?;
        let session = client.session().await?;

        let mut statements = vec![create_statement(&server)];
        let mut tx = client.begin(None).await?;
        let mut membership = None;
        if let Some(owner) = &server.server_owner {
            membership = sql::ensure_membership(&mut tx, session, owner).await?;
            statements.push(format!(
                "ALTER SERVER {} OWNER TO {}",
                ident(&server.server_name),
                ident(owner)
            ));
        }
        sql::exec_all(&mut tx, &statements)
            .await
            .with_context(|| format!("Failed to create foreign server {:?}", server.server_name))?;
        sql::release_membership(&mut tx, session, membership).await?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit foreign server {:?}", server.server_name))?;

        info!(server = %server.server_name, fdw = %server.fdw_name, "Created foreign server");
        let state = ForeignServer {
            id: Some(server.server_name.clone()),
            ..server
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn read(&self, client: &Client, state: &Value) -> Result<Option<Value>> {
        let prior: ForeignServer = decode_model(state)?;
        let mut conn = client.acquire(None).await?;
        type ServerRow = (Option<String>, Option<String>, String, Vec<String>, String);
        let row: Option<ServerRow> = sqlx::query_as(
            "SELECT s.srvtype, s.srvversion, f.fdwname::text, \
                    COALESCE(s.srvoptions, ARRAY[]::text[]), \
                    pg_catalog.pg_get_userbyid(s.srvowner)::text \
             FROM pg_catalog.pg_foreign_server s \
             JOIN pg_catalog.pg_foreign_data_wrapper f ON f.oid = s.srvfdw \
             WHERE s.srvname = $1",
        )
        .bind(&prior.server_name)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("Failed to read foreign server {:?}", prior.server_name))?;

        let Some((server_type, server_version, fdw_name, options, owner)) = row else {
            return Ok(None);
        };
        let current = ForeignServer {
            id: Some(prior.server_name.clone()),
            server_type,
            server_version,
            fdw_name,
            options: sql::parse_options(&options),
            server_owner: Some(owner),
            ..prior
        };
        Ok(Some(encode_model(&current)?))
    }

    async fn update(&self, client: &Client, prior: &Value, planned: &Value) -> Result<Value> {
        let old: ForeignServer = decode_model(prior)?;
        let new: ForeignServer = decode_model(planned)?;
        let session = client.session().await?;

        let mut tx = client.begin(None).await?;
        let membership = match &new.server_owner {
            Some(owner) if old.server_owner.as_ref() != Some(owner) => {
                sql::ensure_membership(&mut tx, session, owner).await?
            }
            _ => None,
        };
        sql::exec_all(&mut tx, &update_statements(&old, &new))
            .await
            .with_context(|| format!("Failed to update foreign server {:?}", new.server_name))?;
        sql::release_membership(&mut tx, session, membership).await?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit foreign server {:?}", new.server_name))?;

        let state = ForeignServer {
            id: Some(new.server_name.clone()),
            ..new
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn delete(&self, client: &Client, state: &Value) -> Result<()> {
        let server: ForeignServer = decode_model(state)?;
        let mut statement = format!("DROP SERVER IF EXISTS {}", ident(&server.server_name));
        if server.drop_cascade {
            statement.push_str(" CASCADE");
        }
        let mut tx = client.begin(None).await?;
        sql::exec(&mut tx, &statement)
            .await
            .with_context(|| format!("Failed to drop foreign server {:?}", server.server_name))?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit drop of {:?}", server.server_name))?;
        info!(server = %server.server_name, "Dropped foreign server");
        Ok(())
    }

    async fn exists(&self, client: &Client, state: &Value) -> Result<bool> {
        let server: ForeignServer = decode_model(state)?;
        let mut conn = client.acquire(None).await?;
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_foreign_server WHERE srvname = $1)",
        )
        .bind(&server.server_name)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("Failed to look up foreign server {:?}", server.server_name))?;
        Ok(exists)
    }

    fn import_state(&self, id: &str) -> Result<Value> {
        Ok(json!({ "id": id, "server_name": id }))
    }
}

pub fn create_statement(server: &ForeignServer) -> String {
    let mut statement = format!("CREATE SERVER {}", ident(&server.server_name));
    if let Some(server_type) = &server.server_type {
        statement.push_str(&format!(" TYPE {}", literal(server_type)));
    }
    if let Some(version) = &server.server_version {
        statement.push_str(&format!(" VERSION {}", literal(version)));
    }
    statement.push_str(&format!(" FOREIGN DATA WRAPPER {}", ident(&server.fdw_name)));
    statement.push_str(&sql::create_options_clause(&server.options));
    statement
}

pub fn update_statements(old: &ForeignServer, new: &ForeignServer) -> Vec<String> {
    let mut statements = Vec::new();
    if old.server_name != new.server_name {
        statements.push(format!(
            "ALTER SERVER {} RENAME TO {}",
            ident(&old.server_name),
            ident(&new.server_name)
        ));
    }
    let name = ident(&new.server_name);
    if old.server_version != new.server_version {
        // There is no way back to "no version"; an empty string stands in.
        let version = new.server_version.as_deref().unwrap_or("");
        statements.push(format!("ALTER SERVER {} VERSION {}", name, literal(version)));
    }
    if let Some(clause) = sql::alter_options_clause(&old.options, &new.options) {
        statements.push(format!("ALTER SERVER {} {}", name, clause));
    }
    if let Some(owner) = &new.server_owner {
        if old.server_owner.as_ref() != Some(owner) {
            statements.push(format!("ALTER SERVER {} OWNER TO {}", name, ident(owner)));
        }
    }
    statements
}
