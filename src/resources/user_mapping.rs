use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::{decode_model, encode_model, refresh, split_id, Resource};
use crate::client::Client;
use crate::schema::{AttrType, Attribute, Block};
use crate::sql::{self, grantee, ident};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserMapping {
    pub id: Option<String>,
    pub user_name: String,
    pub server_name: String,
    pub options: BTreeMap<String, String>,
}

impl UserMapping {
    pub fn generate_id(&self) -> String {
        format!("{}.{}", self.user_name, self.server_name)
    }

    /// `FOR <user> SERVER <server>`
    fn target(&self) -> String {
        format!(
            "FOR {} SERVER {}",
            grantee(&self.user_name),
            ident(&self.server_name)
        )
    }
}

pub struct UserMappingResource;

#[async_trait]
impl Resource for UserMappingResource {
    fn type_name(&self) -> &'static str {
        "postgresql_user_mapping"
    }

    fn schema(&self) -> Block {
        Block::resource(
            "Maps a role to credentials on a foreign server.",
            vec![
                Attribute::required("user_name", AttrType::String)
                    .force_new()
                    .describe("Role to map; `public` for every role"),
                Attribute::required("server_name", AttrType::String).force_new(),
                Attribute::optional("options", AttrType::map_of_strings())
                    .sensitive()
                    .describe("Options such as user and password for the remote server"),
            ],
        )
    }

    async fn create(&self, client: &Client, planned: &Value) -> Result<Value> {
        let mapping: UserMapping = decode_model(planned)?;
        let mut tx = client.begin(None).await?;
        sql::exec(&mut tx, &create_statement(&mapping))
            .await
            .with_context(|| {
                format!(
                    "Failed to create user mapping for {:?} on {:?}",
                    mapping.user_name, mapping.server_name
                )
            })?;
        tx.commit()
            .await
            .context("Failed to commit user mapping")?;

        info!(user = %mapping.user_name, server = %mapping.server_name, "Created user mapping");
        let state = UserMapping {
            id: Some(mapping.generate_id()),
            ..mapping
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn read(&self, client: &Client, state: &Value) -> Result<Option<Value>> {
        let prior: UserMapping = decode_model(state)?;
        let mut conn = client.acquire(None).await?;
        let row: Option<(Option<Vec<String>>,)> = sqlx::query_as(
            "SELECT umoptions FROM pg_catalog.pg_user_mappings \
             WHERE usename = $1 AND srvname = $2",
        )
        .bind(if prior.user_name.eq_ignore_ascii_case("public") {
            "public"
        } else {
            prior.user_name.as_str()
        })
        .bind(&prior.server_name)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| {
            format!(
                "Failed to read user mapping for {:?} on {:?}",
                prior.user_name, prior.server_name
            )
        })?;

        let Some((options,)) = row else {
            return Ok(None);
        };
        let current = UserMapping {
            id: Some(prior.generate_id()),
            // Options are hidden from roles that cannot see them; keep state then.
            options: match options {
                Some(options) => sql::parse_options(&options),
                None => prior.options.clone(),
            },
            ..prior
        };
        Ok(Some(encode_model(&current)?))
    }

    async fn update(&self, client: &Client, prior: &Value, planned: &Value) -> Result<Value> {
        let old: UserMapping = decode_model(prior)?;
        let new: UserMapping = decode_model(planned)?;
        if let Some(statement) = update_statement(&old, &new) {
            let mut tx = client.begin(None).await?;
            sql::exec(&mut tx, &statement).await.with_context(|| {
                format!(
                    "Failed to update user mapping for {:?} on {:?}",
                    new.user_name, new.server_name
                )
            })?;
            tx.commit()
                .await
                .context("Failed to commit user mapping")?;
        }
        let state = UserMapping {
            id: Some(new.generate_id()),
            ..new
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn delete(&self, client: &Client, state: &Value) -> Result<()> {
        let mapping: UserMapping = decode_model(state)?;
        let mut tx = client.begin(None).await?;
        sql::exec(
            &mut tx,
            &format!("DROP USER MAPPING IF EXISTS {}", mapping.target()),
        )
        .await
        .with_context(|| {
            format!(
                "Failed to drop user mapping for {:?} on {:?}",
                mapping.user_name, mapping.server_name
            )
        })?;
        tx.commit()
            .await
            .context("Failed to commit drop of user mapping")?;
        info!(user = %mapping.user_name, server = %mapping.server_name, "Dropped user mapping");
        Ok(())
    }

    async fn exists(&self, client: &Client, state: &Value) -> Result<bool> {
        Ok(self.read(client, state).await?.is_some())
    }

    fn import_state(&self, id: &str) -> Result<Value> {
        let parts = split_id(id, '.', 2, "<user>.<server>")?;
        Ok(json!({ "id": id, "user_name": parts[0], "server_name": parts[1] }))
    }
}

pub fn create_statement(mapping: &UserMapping) -> String {
    format!(
        "CREATE USER MAPPING {}{}",
        mapping.target(),
        sql::create_options_clause(&mapping.options)
    )
}

pub fn update_statement(old: &UserMapping, new: &UserMapping) -> Option<String> {
    sql::alter_options_clause(&old.options, &new.options)
        .map(|clause| format!("ALTER USER MAPPING {} {}", new.target(), clause))
}
