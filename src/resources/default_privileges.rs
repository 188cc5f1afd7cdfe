//! `postgresql_default_privileges`: privileges applied to objects an owner
//! creates in the future.
//!
//! `ALTER DEFAULT PRIVILEGES FOR ROLE owner` needs the session user to be a
//! member of `owner`. A non-superuser provider user is granted that
//! membership for the duration of the transaction and it is revoked again
//! before commit.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::privileges::{self, ObjectType};
use super::{decode_model, encode_model, refresh, Resource};
use crate::client::version::{Feature, ServerVersion};
use crate::client::Client;
use crate::error::ProviderError;
use crate::plugin::diagnostics::Finding;
use crate::schema::{AttrType, Attribute, Block};
use crate::sql::{self, grantee, ident};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultPrivileges {
    pub id: Option<String>,
    pub role: String,
    pub database: String,
    pub owner: String,
    pub schema: Option<String>,
    pub object_type: String,
    pub privileges: BTreeSet<String>,
    pub with_grant_option: bool,
}

impl DefaultPrivileges {
    pub fn kind(&self) -> Result<ObjectType, ProviderError> {
        let kind: ObjectType = self.object_type.parse()?;
        if kind.default_acl_code().is_none() {
            return Err(ProviderError::invalid(
                "object_type",
                format!("default privileges do not support {}", kind),
            ));
        }
        Ok(kind)
    }

    pub fn generate_id(&self) -> String {
        [
            self.role.as_str(),
            self.database.as_str(),
            self.schema.as_deref().unwrap_or(""),
            self.owner.as_str(),
            self.object_type.as_str(),
        ]
        .join("_")
    }

    pub fn check(&self) -> Result<(), ProviderError> {
        let kind = self.kind()?;
        if kind == ObjectType::Schema && self.schema.is_some() {
            return Err(ProviderError::invalid(
                "schema",
                "schema must not be set when object_type is schema",
            ));
        }
        privileges::validate_privileges(kind, &self.privileges)?;
        Ok(())
    }
}

pub struct DefaultPrivilegesResource;

#[async_trait]
impl Resource for DefaultPrivilegesResource {
    fn type_name(&self) -> &'static str {
        "postgresql_default_privileges"
    }

    fn schema(&self) -> Block {
        Block::resource(
            "Default privileges for objects created by a role.",
            vec![
                Attribute::required("role", AttrType::String).force_new(),
                Attribute::required("database", AttrType::String).force_new(),
                Attribute::required("owner", AttrType::String)
                    .force_new()
                    .describe("Role whose future objects receive the privileges"),
                Attribute::optional("schema", AttrType::String).force_new(),
                Attribute::required("object_type", AttrType::String)
                    .force_new()
                    .describe("table, sequence, function, type or schema"),
                Attribute::required("privileges", AttrType::set_of_strings()),
                Attribute::with_default("with_grant_option", AttrType::Bool, json!(false)),
            ],
        )
    }

    fn validate(&self, config: &Value) -> Vec<Finding> {
        if config.get("object_type").map_or(true, Value::is_null) {
            return vec![];
        }
        let defaults: DefaultPrivileges = match decode_model(config) {
            Ok(defaults) => defaults,
            Err(e) => return vec![Finding::error(e.to_string())],
        };
        match defaults.check() {
            Ok(()) => vec![],
            Err(ProviderError::InvalidAttribute { attribute, reason }) => {
                vec![Finding::error(reason).at(&attribute)]
            }
            Err(e) => vec![Finding::error(e.to_string())],
        }
    }

    async fn create(&self, client: &Client, planned: &Value) -> Result<Value> {
        let defaults: DefaultPrivileges = decode_model(planned)?;
        defaults.check()?;
        let version = client.version().await?;
        let privileges = privileges::validate_privileges(defaults.kind()?, &defaults.privileges)?;

        let mut statements = vec![revoke_statement(&defaults, version)?];
        if !privileges.is_empty() {
            statements.push(grant_statement(&defaults, &privileges, version)?);
        }
        apply(client, &defaults, &statements).await?;

        info!(
            role = %defaults.role,
            owner = %defaults.owner,
            object_type = %defaults.object_type,
            "Altered default privileges"
        );
        let state = DefaultPrivileges {
            id: Some(defaults.generate_id()),
            privileges,
            ..defaults
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn read(&self, client: &Client, state: &Value) -> Result<Option<Value>> {
        let prior: DefaultPrivileges = decode_model(state)?;
        let kind = prior.kind()?;
        let code = kind.default_acl_code().unwrap_or_default();

        let mut conn = client.acquire(Some(&prior.database)).await?;
        let rows: Vec<(String, bool)> = sqlx::query_as(
            "SELECT acl.privilege_type::text, acl.is_grantable FROM ( \
                 SELECT (pg_catalog.aclexplode(d.defaclacl)).* \
                 FROM pg_catalog.pg_default_acl d \
                 JOIN pg_catalog.pg_roles o ON o.oid = d.defaclrole \
                 LEFT JOIN pg_catalog.pg_namespace n ON n.oid = d.defaclnamespace \
                 WHERE o.rolname = $1 AND d.defaclobjtype = $2::\"char\" \
                   AND COALESCE(n.nspname, '') = $3 \
             ) acl \
             WHERE acl.grantee = (CASE WHEN $4 = 'public' THEN 0::oid \
                 ELSE (SELECT oid FROM pg_catalog.pg_roles WHERE rolname = $4) END)",
        )
        .bind(&prior.owner)
        .bind(code)
        .bind(prior.schema.as_deref().unwrap_or(""))
        .bind(if prior.role.eq_ignore_ascii_case("public") {
            "public"
        } else {
            prior.role.as_str()
        })
        .fetch_all(&mut *conn)
        .await
        .with_context(|| {
            format!(
                "Failed to read default privileges of {:?} for {:?}",
                prior.owner, prior.role
            )
        })?;

        let granted: BTreeSet<String> = rows.iter().map(|(p, _)| p.clone()).collect();
        let with_grant_option = if rows.is_empty() {
            prior.with_grant_option
        } else {
            rows.iter().all(|(_, grantable)| *grantable)
        };
        let current = DefaultPrivileges {
            id: Some(prior.generate_id()),
            privileges: privileges::normalize_read(kind, granted, &prior.privileges),
            with_grant_option,
            ..prior
        };
        Ok(Some(encode_model(&current)?))
    }

    async fn update(&self, client: &Client, _prior: &Value, planned: &Value) -> Result<Value> {
        // Default ACLs are small; revoke and grant the full set again.
        let defaults: DefaultPrivileges = decode_model(planned)?;
        defaults.check()?;
        let version = client.version().await?;
        let privileges = privileges::validate_privileges(defaults.kind()?, &defaults.privileges)?;

        let mut statements = vec![revoke_statement(&defaults, version)?];
        if !privileges.is_empty() {
            statements.push(grant_statement(&defaults, &privileges, version)?);
        }
        apply(client, &defaults, &statements).await?;

        let state = DefaultPrivileges {
            id: Some(defaults.generate_id()),
            privileges,
            ..defaults
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn delete(&self, client: &Client, state: &Value) -> Result<()> {
        let defaults: DefaultPrivileges = decode_model(state)?;
        let version = client.version().await?;
        let statement = revoke_statement(&defaults, version)?;
        apply(client, &defaults, &[statement]).await?;
        info!(role = %defaults.role, owner = %defaults.owner, "Revoked default privileges");
        Ok(())
    }

    async fn exists(&self, client: &Client, state: &Value) -> Result<bool> {
        let defaults: DefaultPrivileges = decode_model(state)?;
        let mut conn = client.acquire(None).await?;
        Ok(sql::database_exists(&mut conn, &defaults.database).await?
            && sql::role_exists(&mut conn, &defaults.role).await?
            && sql::role_exists(&mut conn, &defaults.owner).await?)
    }

    fn import_state(&self, _id: &str) -> Result<Value> {
        Err(ProviderError::ImportNotSupported("postgresql_default_privileges").into())
    }
}

/// Run `statements` in the target database as a member of the owner.
async fn apply(client: &Client, defaults: &DefaultPrivileges, statements: &[String]) -> Result<()> {
    let session = client.session().await?;
    let mut tx = client.begin(Some(&defaults.database)).await?;
    if !defaults.role.eq_ignore_ascii_case("public") {
        sql::lock_role(&mut tx, &defaults.role).await?;
    }
    let membership = sql::ensure_membership(&mut tx, session, &defaults.owner).await?;
    sql::exec_all(&mut tx, statements).await.with_context(|| {
        format!(
            "Failed to alter default privileges of {:?} for {:?}",
            defaults.owner, defaults.role
        )
    })?;
    sql::release_membership(&mut tx, session, membership).await?;
    tx.commit().await.with_context(|| {
        format!(
            "Failed to commit default privileges of {:?} for {:?}",
            defaults.owner, defaults.role
        )
    })?;
    Ok(())
}

/// `ALTER DEFAULT PRIVILEGES FOR ROLE owner [IN SCHEMA s]`
fn prefix(defaults: &DefaultPrivileges, version: ServerVersion) -> Result<String> {
    let kind = defaults.kind()?;
    if kind == ObjectType::Schema {
        version.require(Feature::PrivilegesOnSchemas)?;
    }
    let mut prefix = format!("ALTER DEFAULT PRIVILEGES FOR ROLE {}", ident(&defaults.owner));
    if let Some(schema) = &defaults.schema {
        prefix.push_str(&format!(" IN SCHEMA {}", ident(schema)));
    }
    Ok(prefix)
}

pub fn grant_statement(
    defaults: &DefaultPrivileges,
    privileges: &BTreeSet<String>,
    version: ServerVersion,
) -> Result<String> {
    let kind = defaults.kind()?;
    let mut statement = format!(
        "{} GRANT {} ON {} TO {}",
        prefix(defaults, version)?,
        privileges::privilege_list(privileges),
        kind.plural_keyword().unwrap_or_default(),
        grantee(&defaults.role)
    );
    if defaults.with_grant_option {
        statement.push_str(" WITH GRANT OPTION");
    }
    Ok(statement)
}

pub fn revoke_statement(defaults: &DefaultPrivileges, version: ServerVersion) -> Result<String> {
    let kind = defaults.kind()?;
    Ok(format!(
        "{} REVOKE ALL ON {} FROM {}",
        prefix(defaults, version)?,
        kind.plural_keyword().unwrap_or_default(),
        grantee(&defaults.role)
    ))
}
