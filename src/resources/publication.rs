use std::collections::BTreeSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::{database_or_default, decode_model, encode_model, refresh, split_id, Resource};
use crate::client::version::{Feature, ServerVersion};
use crate::client::Client;
use crate::plugin::diagnostics::Finding;
use crate::schema::{AttrType, Attribute, Block};
use crate::sql::{self, ident, literal, qualified, split_qualified};

const PUBLISH_OPERATIONS: &[&str] = &["insert", "update", "delete", "truncate"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Publication {
    pub id: Option<String>,
    pub name: String,
    pub database: Option<String>,
    pub owner: Option<String>,
    pub tables: BTreeSet<String>,
    pub all_tables: Option<bool>,
    pub publish_param: Vec<String>,
    pub publish_via_partition_root: Option<bool>,
    pub drop_cascade: bool,
}

impl Publication {
    fn id_for(&self, database: &str) -> String {
        format!("{}.{}", database, self.name)
    }
}

pub struct PublicationResource;

#[async_trait]
impl Resource for PublicationResource {
    fn type_name(&self) -> &'static str {
        "postgresql_publication"
    }

    fn schema(&self) -> Block {
        Block::resource(
            "A logical replication publication.",
            vec![
                Attribute::required("name", AttrType::String),
                Attribute::optional_computed("database", AttrType::String).force_new(),
                Attribute::optional_computed("owner", AttrType::String),
                Attribute::optional("tables", AttrType::set_of_strings())
                    .describe("Tables to publish, as schema.table"),
                Attribute::optional_computed("all_tables", AttrType::Bool)
                    .force_new()
                    .describe("Publish every table, including ones created later"),
                Attribute::optional_computed("publish_param", AttrType::list_of_strings())
                    .describe("Operations to publish: insert, update, delete, truncate"),
                Attribute::optional_computed("publish_via_partition_root", AttrType::Bool),
                Attribute::with_default("drop_cascade", AttrType::Bool, json!(false)),
            ],
        )
    }

    fn validate(&self, config: &Value) -> Vec<Finding> {
        let mut findings = Vec::new();
        let all_tables = config.get("all_tables").and_then(Value::as_bool) == Some(true);
        let has_tables = config
            .get("tables")
            .and_then(Value::as_array)
            .is_some_and(|t| !t.is_empty());
        if all_tables && has_tables {
            findings.push(
                Finding::error("tables cannot be set together with all_tables").at("tables"),
            );
        }
        if let Some(params) = config.get("publish_param").and_then(Value::as_array) {
            for param in params.iter().filter_map(Value::as_str) {
                if !PUBLISH_OPERATIONS.contains(&param) {
                    findings.push(
                        Finding::error(format!(
                            "{:?} is not one of {:?}",
                            param, PUBLISH_OPERATIONS
                        ))
                        .at("publish_param"),
                    );
                }
            }
        }
        findings
    }

    async fn create(&self, client: &Client, planned: &Value) -> Result<Value> {
        let publication: Publication = decode_model(planned)?;
        let version = client.version().await?;
        version.require(Feature::Publication)?;
        let database = database_or_default(client, &publication.database).to_string();
        let session = client.session().await?;

        let mut statements = vec![create_statement(&publication, version)?];
        let mut membership = None;
        let mut tx = client.begin(Some(&database)).await?;
        if let Some(owner) = &publication.owner {
            membership = sql::ensure_membership(&mut tx, session, owner).await?;
            statements.push(format!(
                "ALTER PUBLICATION {} OWNER TO {}",
                ident(&publication.name),
                ident(owner)
            ));
        }
        sql::exec_all(&mut tx, &statements)
            .await
            .with_context(|| format!("Failed to create publication {:?}", publication.name))?;
        sql::release_membership(&mut tx, session, membership).await?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit publication {:?}", publication.name))?;

        info!(publication = %publication.name, database = %database, "Created publication");
        let state = Publication {
            id: Some(publication.id_for(&database)),
            database: Some(database),
            ..publication
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn read(&self, client: &Client, state: &Value) -> Result<Option<Value>> {
        let prior: Publication = decode_model(state)?;
        let database = database_or_default(client, &prior.database).to_string();
        let version = client.version().await?;
        let truncate = if version.supports(Feature::PublicationTruncate) {
            "p.pubtruncate"
        } else {
            "false"
        };
        let via_root = if version.supports(Feature::PublishViaPartitionRoot) {
            "p.pubviaroot"
        } else {
            "false"
        };
        let query = format!(
            "SELECT pg_catalog.pg_get_userbyid(p.pubowner)::text, p.puballtables, \
                    p.pubinsert, p.pubupdate, p.pubdelete, {}, {} \
             FROM pg_catalog.pg_publication p WHERE p.pubname = $1",
            truncate, via_root
        );

        let mut conn = client.acquire(Some(&database)).await?;
        let row: Option<(String, bool, bool, bool, bool, bool, bool)> = sqlx::query_as(&query)
            .bind(&prior.name)
            .fetch_optional(&mut *conn)
            .await
            .with_context(|| format!("Failed to read publication {:?}", prior.name))?;
        let Some((owner, all_tables, insert, update, delete, truncate, via_root)) = row else {
            return Ok(None);
        };

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT schemaname::text || '.' || tablename::text \
             FROM pg_catalog.pg_publication_tables WHERE pubname = $1",
        )
        .bind(&prior.name)
        .fetch_all(&mut *conn)
        .await
        .with_context(|| format!("Failed to read tables of publication {:?}", prior.name))?;

        let publish_param = [
            ("insert", insert),
            ("update", update),
            ("delete", delete),
            ("truncate", truncate),
        ]
        .iter()
        .filter(|(_, on)| *on)
        .map(|(op, _)| op.to_string())
        .collect();

        let current = Publication {
            id: Some(prior.id_for(&database)),
            database: Some(database),
            owner: Some(owner),
            // An all-tables publication lists every table; state keeps it empty.
            tables: if all_tables {
                BTreeSet::new()
            } else {
                tables.into_iter().collect()
            },
            all_tables: Some(all_tables),
            publish_param,
            publish_via_partition_root: Some(via_root),
            ..prior
        };
        Ok(Some(encode_model(&current)?))
    }

    async fn update(&self, client: &Client, prior: &Value, planned: &Value) -> Result<Value> {
        let old: Publication = decode_model(prior)?;
        let new: Publication = decode_model(planned)?;
        let version = client.version().await?;
        let database = database_or_default(client, &old.database).to_string();
        let session = client.session().await?;
        let statements = update_statements(&old, &new, version)?;

        let mut tx = client.begin(Some(&database)).await?;
        let membership = match &new.owner {
            Some(owner) if old.owner.as_ref() != Some(owner) => {
                sql::ensure_membership(&mut tx, session, owner).await?
            }
            _ => None,
        };
        sql::exec_all(&mut tx, &statements)
            .await
            .with_context(|| format!("Failed to update publication {:?}", new.name))?;
        sql::release_membership(&mut tx, session, membership).await?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit publication {:?}", new.name))?;

        let state = Publication {
            id: Some(new.id_for(&database)),
            database: Some(database),
            ..new
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn delete(&self, client: &Client, state: &Value) -> Result<()> {
        let publication: Publication = decode_model(state)?;
        let database = database_or_default(client, &publication.database).to_string();
        let mut tx = client.begin(Some(&database)).await?;
        let mut statement = format!("DROP PUBLICATION IF EXISTS {}", ident(&publication.name));
        if publication.drop_cascade {
            statement.push_str(" CASCADE");
        }
        sql::exec(&mut tx, &statement)
            .await
            .with_context(|| format!("Failed to drop publication {:?}", publication.name))?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit drop of {:?}", publication.name))?;
        info!(publication = %publication.name, database = %database, "Dropped publication");
        Ok(())
    }

    async fn exists(&self, client: &Client, state: &Value) -> Result<bool> {
        let publication: Publication = decode_model(state)?;
        let database = database_or_default(client, &publication.database).to_string();
        let mut conn = client.acquire(None).await?;
        if !sql::database_exists(&mut conn, &database).await? {
            return Ok(false);
        }
        let mut conn = client.acquire(Some(&database)).await?;
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_publication WHERE pubname = $1)",
        )
        .bind(&publication.name)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("Failed to look up publication {:?}", publication.name))?;
        Ok(exists)
    }

    fn import_state(&self, id: &str) -> Result<Value> {
        let parts = split_id(id, '.', 2, "<database>.<publication>")?;
        Ok(json!({ "id": id, "database": parts[0], "name": parts[1] }))
    }
}

fn table_list(tables: &BTreeSet<String>) -> String {
    tables
        .iter()
        .map(|t| {
            let (schema, table) = split_qualified(t);
            qualified(schema, table)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `WITH (...)` parameters, or None when neither is set.
fn with_clause(publication: &Publication, version: ServerVersion) -> Result<Option<String>> {
    let mut params = Vec::new();
    if !publication.publish_param.is_empty() {
        if publication.publish_param.iter().any(|p| p == "truncate") {
            version.require(Feature::PublicationTruncate)?;
        }
        params.push(format!(
            "publish = {}",
            literal(&publication.publish_param.join(", "))
        ));
    }
    if let Some(via_root) = publication.publish_via_partition_root {
        if version.supports(Feature::PublishViaPartitionRoot) {
            params.push(format!("publish_via_partition_root = {}", via_root));
        } else if via_root {
            version.require(Feature::PublishViaPartitionRoot)?;
        }
    }
    Ok((!params.is_empty()).then(|| params.join(", ")))
}

pub fn create_statement(publication: &Publication, version: ServerVersion) -> Result<String> {
    let mut statement = format!("CREATE PUBLICATION {}", ident(&publication.name));
    if publication.all_tables == Some(true) {
        statement.push_str(" FOR ALL TABLES");
    } else if !publication.tables.is_empty() {
        statement.push_str(" FOR TABLE ");
        statement.push_str(&table_list(&publication.tables));
    }
    if let Some(params) = with_clause(publication, version)? {
        statement.push_str(&format!(" WITH ({})", params));
    }
    Ok(statement)
}

pub fn update_statements(
    old: &Publication,
    new: &Publication,
    version: ServerVersion,
) -> Result<Vec<String>> {
    let mut statements = Vec::new();
    if old.name != new.name {
        statements.push(format!(
            "ALTER PUBLICATION {} RENAME TO {}",
            ident(&old.name),
            ident(&new.name)
        ));
    }
    let name = ident(&new.name);
    if let Some(owner) = &new.owner {
        if old.owner.as_ref() != Some(owner) {
            statements.push(format!("ALTER PUBLICATION {} OWNER TO {}", name, ident(owner)));
        }
    }
    if new.all_tables != Some(true) {
        let added: BTreeSet<String> = new.tables.difference(&old.tables).cloned().collect();
        let dropped: BTreeSet<String> = old.tables.difference(&new.tables).cloned().collect();
        if !added.is_empty() {
            statements.push(format!(
                "ALTER PUBLICATION {} ADD TABLE {}",
                name,
                table_list(&added)
            ));
        }
        if !dropped.is_empty() {
            statements.push(format!(
                "ALTER PUBLICATION {} DROP TABLE {}",
                name,
                table_list(&dropped)
            ));
        }
    }
    if old.publish_param != new.publish_param
        || old.publish_via_partition_root != new.publish_via_partition_root
    {
        if let Some(params) = with_clause(new, version)? {
            statements.push(format!("ALTER PUBLICATION {} SET ({})", name, params));
        }
    }
    Ok(statements)
}
