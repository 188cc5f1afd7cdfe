use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::{decode_model, encode_model, refresh, Resource};
use crate::client::Client;
use crate::error::ProviderError;
use crate::schema::{AttrType, Attribute, Block};
use crate::sql::{self, ident};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrantRole {
    pub id: Option<String>,
    pub role: String,
    pub grant_role: String,
    pub with_admin_option: bool,
}

impl GrantRole {
    pub fn generate_id(&self) -> String {
        format!("{}_{}_{}", self.role, self.grant_role, self.with_admin_option)
    }
}

/// Membership of one role in another.
pub struct GrantRoleResource;

#[async_trait]
impl Resource for GrantRoleResource {
    fn type_name(&self) -> &'static str {
        "postgresql_grant_role"
    }

    fn schema(&self) -> Block {
        Block::resource(
            "Membership of a role in another role.",
            vec![
                Attribute::required("role", AttrType::String)
                    .force_new()
                    .describe("Role that receives the membership"),
                Attribute::required("grant_role", AttrType::String)
                    .force_new()
                    .describe("Role being granted"),
                Attribute::with_default("with_admin_option", AttrType::Bool, json!(false))
                    .force_new(),
            ],
        )
    }

    async fn create(&self, client: &Client, planned: &Value) -> Result<Value> {
        let grant: GrantRole = decode_model(planned)?;
        let mut tx = client.begin(None).await?;
        sql::lock_role(&mut tx, &grant.role).await?;
        sql::exec_all(&mut tx, &create_statements(&grant))
            .await
            .with_context(|| {
                format!("Failed to grant {:?} to {:?}", grant.grant_role, grant.role)
            })?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit membership of {:?}", grant.role))?;

        info!(role = %grant.role, grant_role = %grant.grant_role, "Granted role membership");
        let state = GrantRole {
            id: Some(grant.generate_id()),
            ..grant
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn read(&self, client: &Client, state: &Value) -> Result<Option<Value>> {
        let prior: GrantRole = decode_model(state)?;
        let mut conn = client.acquire(None).await?;
        let admin: Option<bool> = sqlx::query_scalar(
            "SELECT bool_or(m.admin_option) FROM pg_catalog.pg_auth_members m \
             JOIN pg_catalog.pg_roles r ON r.oid = m.member \
             JOIN pg_catalog.pg_roles g ON g.oid = m.roleid \
             WHERE r.rolname = $1 AND g.rolname = $2 \
             HAVING count(*) > 0",
        )
        .bind(&prior.role)
        .bind(&prior.grant_role)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| {
            format!(
                "Failed to read membership of {:?} in {:?}",
                prior.role, prior.grant_role
            )
        })?;

        let Some(with_admin_option) = admin else {
            return Ok(None);
        };
        let current = GrantRole {
            with_admin_option,
            ..prior
        };
        Ok(Some(encode_model(&GrantRole {
            id: Some(current.generate_id()),
            ..current
        })?))
    }

    async fn update(&self, client: &Client, _prior: &Value, planned: &Value) -> Result<Value> {
        // Every attribute forces replacement.
        let grant: GrantRole = decode_model(planned)?;
        refresh(self, client, &encode_model(&grant)?).await
    }

    async fn delete(&self, client: &Client, state: &Value) -> Result<()> {
        let grant: GrantRole = decode_model(state)?;
        let mut tx = client.begin(None).await?;
        sql::lock_role(&mut tx, &grant.role).await?;
        sql::exec(&mut tx, &revoke_statement(&grant))
            .await
            .with_context(|| {
                format!("Failed to revoke {:?} from {:?}", grant.grant_role, grant.role)
            })?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit revoke for {:?}", grant.role))?;
        info!(role = %grant.role, grant_role = %grant.grant_role, "Revoked role membership");
        Ok(())
    }

    async fn exists(&self, client: &Client, state: &Value) -> Result<bool> {
        let grant: GrantRole = decode_model(state)?;
        let mut conn = client.acquire(None).await?;
        Ok(sql::role_exists(&mut conn, &grant.role).await?
            && sql::role_exists(&mut conn, &grant.grant_role).await?)
    }

    fn import_state(&self, _id: &str) -> Result<Value> {
        Err(ProviderError::ImportNotSupported("postgresql_grant_role").into())
    }
}

/// Revoke first so an existing grant with a different admin option is
/// replaced rather than kept.
pub fn create_statements(grant: &GrantRole) -> Vec<String> {
    let mut granted = format!("GRANT {} TO {}", ident(&grant.grant_role), ident(&grant.role));
    if grant.with_admin_option {
        granted.push_str(" WITH ADMIN OPTION");
    }
    vec![revoke_statement(grant), granted]
}

pub fn revoke_statement(grant: &GrantRole) -> String {
    format!(
        "REVOKE {} FROM {}",
        ident(&grant.grant_role),
        ident(&grant.role)
    )
}
