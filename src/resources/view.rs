use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::{
    database_or_default, decode_model, default_public, encode_model, refresh, split_id, Resource,
};
use crate::client::version::{Feature, ServerVersion};
use crate::client::Client;
use crate::plugin::diagnostics::Finding;
use crate::schema::{AttrType, Attribute, Block};
use crate::sql::{self, qualified};

const CHECK_OPTIONS: &[&str] = &["CASCADED", "LOCAL"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct View {
    pub id: Option<String>,
    pub name: String,
    pub database: Option<String>,
    #[serde(default = "default_public")]
    pub schema: String,
    pub query: String,
    pub check_option: Option<String>,
    pub with_security_barrier: bool,
    pub with_security_invoker: bool,
    pub drop_cascade: bool,
}

impl View {
    fn id_for(&self, database: &str) -> String {
        format!("{}.{}.{}", database, self.schema, self.name)
    }
}

pub struct ViewResource;

#[async_trait]
impl Resource for ViewResource {
    fn type_name(&self) -> &'static str {
        "postgresql_view"
    }

    fn schema(&self) -> Block {
        Block::resource(
            "A view defined by a SELECT query.",
            vec![
                Attribute::required("name", AttrType::String).force_new(),
                Attribute::optional_computed("database", AttrType::String).force_new(),
                Attribute::with_default("schema", AttrType::String, json!("public")).force_new(),
                Attribute::required("query", AttrType::String)
                    .describe("The SELECT statement defining the view"),
                Attribute::optional("check_option", AttrType::String)
                    .describe("CASCADED or LOCAL"),
                Attribute::with_default("with_security_barrier", AttrType::Bool, json!(false)),
                Attribute::with_default("with_security_invoker", AttrType::Bool, json!(false)),
                Attribute::with_default("drop_cascade", AttrType::Bool, json!(false)),
            ],
        )
    }

    fn validate(&self, config: &Value) -> Vec<Finding> {
        let mut findings = Vec::new();
        if let Some(option) = config.get("check_option").and_then(Value::as_str) {
            // The catalog reports the option upper-cased; any other spelling
            // would diff on every plan.
            if !CHECK_OPTIONS.contains(&option) {
                findings.push(
                    Finding::error(format!("check_option must be one of {:?}", CHECK_OPTIONS))
                        .at("check_option"),
                );
            }
        }
        if config
            .get("query")
            .and_then(Value::as_str)
            .is_some_and(|q| q.trim().is_empty())
        {
            findings.push(Finding::error("query must not be empty").at("query"));
        }
        findings
    }

    async fn create(&self, client: &Client, planned: &Value) -> Result<Value> {
        let view: View = decode_model(planned)?;
        let database = database_or_default(client, &view.database).to_string();
        let version = client.version().await?;
        let statement = create_statement(&view, version, false)?;

        let mut tx = client.begin(Some(&database)).await?;
        sql::exec(&mut tx, &statement)
            .await
            .with_context(|| format!("Failed to create view {:?}", view.name))?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit view {:?}", view.name))?;

        info!(view = %view.name, schema = %view.schema, database = %database, "Created view");
        let state = View {
            id: Some(view.id_for(&database)),
            database: Some(database),
            ..view
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn read(&self, client: &Client, state: &Value) -> Result<Option<Value>> {
        let prior: View = decode_model(state)?;
        let database = database_or_default(client, &prior.database).to_string();
        let mut conn = client.acquire(Some(&database)).await?;
        let row: Option<(Vec<String>, String)> = sqlx::query_as(
            "SELECT COALESCE(c.reloptions, ARRAY[]::text[]), pg_catalog.pg_get_viewdef(c.oid) \
             FROM pg_catalog.pg_class c \
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
             WHERE c.relkind = 'v' AND n.nspname = $1 AND c.relname = $2",
        )
        .bind(&prior.schema)
        .bind(&prior.name)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("Failed to read view {:?}", prior.name))?;

        let Some((reloptions, definition)) = row else {
            return Ok(None);
        };
        // The server rewrites the query text, so the configured text is kept
        // unless the view was emptied out of band.
        let query = if prior.query.is_empty() {
            definition.trim().trim_end_matches(';').to_string()
        } else {
            prior.query.clone()
        };
        let options = sql::parse_options(&reloptions);
        let current = View {
            id: Some(prior.id_for(&database)),
            database: Some(database),
            query,
            check_option: options.get("check_option").map(|v| v.to_ascii_uppercase()),
            with_security_barrier: options.get("security_barrier").is_some_and(|v| v == "true"),
            with_security_invoker: options.get("security_invoker").is_some_and(|v| v == "true"),
            ..prior
        };
        Ok(Some(encode_model(&current)?))
    }

    async fn update(&self, client: &Client, _prior: &Value, planned: &Value) -> Result<Value> {
        let view: View = decode_model(planned)?;
        let database = database_or_default(client, &view.database).to_string();
        let version = client.version().await?;
        let statement = create_statement(&view, version, true)?;

        let mut tx = client.begin(Some(&database)).await?;
        sql::exec(&mut tx, &statement)
            .await
            .with_context(|| format!("Failed to replace view {:?}", view.name))?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit view {:?}", view.name))?;

        let state = View {
            id: Some(view.id_for(&database)),
            database: Some(database),
            ..view
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn delete(&self, client: &Client, state: &Value) -> Result<()> {
        let view: View = decode_model(state)?;
        let database = database_or_default(client, &view.database).to_string();
        let mut tx = client.begin(Some(&database)).await?;
        sql::exec(&mut tx, &drop_statement(&view))
            .await
            .with_context(|| format!("Failed to drop view {:?}", view.name))?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit drop of view {:?}", view.name))?;
        info!(view = %view.name, database = %database, "Dropped view");
        Ok(())
    }

    async fn exists(&self, client: &Client, state: &Value) -> Result<bool> {
        Ok(self.read(client, state).await?.is_some())
    }

    fn import_state(&self, id: &str) -> Result<Value> {
        let parts = split_id(id, '.', 3, "<database>.<schema>.<view>")?;
        Ok(json!({
            "id": id,
            "database": parts[0],
            "schema": parts[1],
            "name": parts[2],
        }))
    }
}

/// `CREATE [OR REPLACE] VIEW`. View options are always spelled out so a
/// replace resets options that were switched off.
pub fn create_statement(view: &View, version: ServerVersion, replace: bool) -> Result<String> {
    let mut options = vec![format!("security_barrier={}", view.with_security_barrier)];
    if version.supports(Feature::SecurityInvokerViews) {
        options.push(format!("security_invoker={}", view.with_security_invoker));
    } else if view.with_security_invoker {
        version.require(Feature::SecurityInvokerViews)?;
    }

    let mut statement = format!(
        "CREATE {}VIEW {} WITH ({}) AS {}",
        if replace { "OR REPLACE " } else { "" },
        qualified(&view.schema, &view.name),
        options.join(", "),
        view.query.trim().trim_end_matches(';')
    );
    if let Some(check) = &view.check_option {
        statement.push_str(&format!(" WITH {} CHECK OPTION", check.to_ascii_uppercase()));
    }
    Ok(statement)
}

pub fn drop_statement(view: &View) -> String {
    let mut statement = format!("DROP VIEW IF EXISTS {}", qualified(&view.schema, &view.name));
    if view.drop_cascade {
        statement.push_str(" CASCADE");
    }
    statement
}
