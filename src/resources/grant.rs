//! `postgresql_grant`: object privileges for one role.
//!
//! Grants are authoritative. Creating one first revokes whatever the role
//! already holds on the target, then grants the configured privileges, all
//! under an advisory lock on the role so concurrent grants for the same role
//! do not interleave.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::privileges::{self, ObjectType};
use super::{decode_model, encode_model, refresh, Resource};
use crate::client::version::{Feature, ServerVersion};
use crate::client::Client;
use crate::error::ProviderError;
use crate::plugin::diagnostics::Finding;
use crate::schema::{AttrType, Attribute, Block};
use crate::sql::{self, grantee, ident, qualified};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Grant {
    pub id: Option<String>,
    pub role: String,
    pub database: String,
    pub schema: Option<String>,
    pub object_type: String,
    pub objects: BTreeSet<String>,
    pub columns: BTreeSet<String>,
    pub privileges: BTreeSet<String>,
    pub with_grant_option: bool,
}

impl Grant {
    pub fn kind(&self) -> Result<ObjectType, ProviderError> {
        self.object_type.parse()
    }

    /// `role_database[_schema]_objecttype[_object...]`
    pub fn generate_id(&self) -> String {
        let mut parts = vec![self.role.as_str(), self.database.as_str()];
        if let Some(schema) = &self.schema {
            parts.push(schema);
        }
        parts.push(&self.object_type);
        parts.extend(self.objects.iter().map(String::as_str));
        parts.join("_")
    }

    /// Check the combination of attributes before touching the database.
    pub fn check(&self) -> Result<(), ProviderError> {
        let kind = self.kind()?;
        if kind == ObjectType::Type {
            return Err(ProviderError::invalid(
                "object_type",
                "type privileges are only managed through postgresql_default_privileges",
            ));
        }
        if kind.needs_schema() && self.schema.is_none() {
            return Err(ProviderError::invalid(
                "schema",
                format!("schema is required for object_type {}", kind),
            ));
        }
        if kind == ObjectType::Database && self.schema.is_some() {
            return Err(ProviderError::invalid(
                "schema",
                "schema must not be set for object_type database",
            ));
        }
        if !kind.takes_objects() && !self.objects.is_empty() {
            return Err(ProviderError::invalid(
                "objects",
                format!("objects must not be set for object_type {}", kind),
            ));
        }
        if matches!(
            kind,
            ObjectType::ForeignDataWrapper | ObjectType::ForeignServer
        ) && self.objects.is_empty()
        {
            return Err(ProviderError::invalid(
                "objects",
                format!("objects is required for object_type {}", kind),
            ));
        }
        if kind == ObjectType::Column {
            if self.objects.len() != 1 {
                return Err(ProviderError::invalid(
                    "objects",
                    "column grants need exactly one table in objects",
                ));
            }
            if self.columns.is_empty() {
                return Err(ProviderError::invalid(
                    "columns",
                    "columns is required for object_type column",
                ));
            }
        } else if !self.columns.is_empty() {
            return Err(ProviderError::invalid(
                "columns",
                "columns is only valid for object_type column",
            ));
        }
        privileges::validate_privileges(kind, &self.privileges)?;
        Ok(())
    }

    fn normalized_privileges(&self) -> Result<BTreeSet<String>, ProviderError> {
        privileges::validate_privileges(self.kind()?, &self.privileges)
    }
}

pub struct GrantResource;

#[async_trait]
impl Resource for GrantResource {
    fn type_name(&self) -> &'static str {
        "postgresql_grant"
    }

    fn schema(&self) -> Block {
        Block::resource(
            "Privileges granted to a role on database objects.",
            vec![
                Attribute::required("role", AttrType::String)
                    .force_new()
                    .describe("Role receiving the privileges; `public` for PUBLIC"),
                Attribute::required("database", AttrType::String).force_new(),
                Attribute::optional("schema", AttrType::String).force_new(),
                Attribute::required("object_type", AttrType::String)
                    .force_new()
                    .describe("database, schema, table, sequence, function, procedure, routine, foreign_data_wrapper, foreign_server or column"),
                Attribute::optional("objects", AttrType::set_of_strings())
                    .force_new()
                    .describe("Objects to grant on; every object of the type in the schema when empty"),
                Attribute::optional("columns", AttrType::set_of_strings()).force_new(),
                Attribute::required("privileges", AttrType::set_of_strings()),
                Attribute::with_default("with_grant_option", AttrType::Bool, json!(false)),
            ],
        )
    }

    fn validate(&self, config: &Value) -> Vec<Finding> {
        // Unknown values arrive as null and are checked again at apply.
        if config.get("object_type").map_or(true, Value::is_null) {
            return vec![];
        }
        let grant: Grant = match decode_model(config) {
            Ok(grant) => grant,
            Err(e) => return vec![Finding::error(e.to_string())],
        };
        match grant.check() {
            Ok(()) => vec![],
            Err(ProviderError::InvalidAttribute { attribute, reason }) => {
                vec![Finding::error(reason).at(&attribute)]
            }
            Err(e) => vec![Finding::error(e.to_string())],
        }
    }

    async fn create(&self, client: &Client, planned: &Value) -> Result<Value> {
        let grant: Grant = decode_model(planned)?;
        grant.check()?;
        let version = client.version().await?;
        let kind = grant.kind()?;
        let privileges = grant.normalized_privileges()?;

        let mut statements = vec![revoke_all_statement(&grant, version)?];
        if !privileges.is_empty() {
            statements.push(grant_statement(&grant, &privileges, version)?);
        }

        let mut tx = client.begin(Some(&grant.database)).await?;
        if !grant.role.eq_ignore_ascii_case("public") {
            sql::lock_role(&mut tx, &grant.role).await?;
        }
        sql::exec_all(&mut tx, &statements).await.with_context(|| {
            format!("Failed to grant {} privileges to {:?}", kind, grant.role)
        })?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit grant for {:?}", grant.role))?;

        info!(role = %grant.role, object_type = %kind, database = %grant.database, "Granted privileges");
        let state = Grant {
            id: Some(grant.generate_id()),
            privileges,
            ..grant
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn read(&self, client: &Client, state: &Value) -> Result<Option<Value>> {
        let prior: Grant = decode_model(state)?;
        let kind = prior.kind()?;
        let version = client.version().await?;

        let mut conn = client.acquire(Some(&prior.database)).await?;
        let query = acl_query(kind, version)?;
        let role = if prior.role.eq_ignore_ascii_case("public") {
            "public".to_string()
        } else {
            prior.role.clone()
        };
        let rows: Vec<AclRow> = sqlx::query_as(&query)
            .bind(&role)
            .bind(prior.schema.as_deref().unwrap_or(""))
            .bind(acl_target_name(&prior))
            .fetch_all(&mut *conn)
            .await
            .with_context(|| format!("Failed to read {} privileges of {:?}", kind, prior.role))?;
        debug!(role = %prior.role, object_type = %kind, rows = rows.len(), "Read privileges");

        let (granted, grantable) = summarize_acl(&prior, &rows);
        let privileges = match granted {
            Some(granted) => privileges::normalize_read(kind, granted, &prior.privileges),
            // Nothing to inspect, e.g. an empty schema: keep what was asked for.
            None => prior.privileges.clone(),
        };
        let current = Grant {
            id: Some(prior.generate_id()),
            with_grant_option: grantable.unwrap_or(prior.with_grant_option),
            privileges,
            ..prior
        };
        Ok(Some(encode_model(&current)?))
    }

    async fn update(&self, client: &Client, prior: &Value, planned: &Value) -> Result<Value> {
        let old: Grant = decode_model(prior)?;
        let new: Grant = decode_model(planned)?;
        new.check()?;
        let version = client.version().await?;
        let statements = update_statements(&old, &new, version)?;

        let mut tx = client.begin(Some(&new.database)).await?;
        if !new.role.eq_ignore_ascii_case("public") {
            sql::lock_role(&mut tx, &new.role).await?;
        }
        sql::exec_all(&mut tx, &statements)
            .await
            .with_context(|| format!("Failed to update privileges of {:?}", new.role))?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit grant for {:?}", new.role))?;

        let state = Grant {
            id: Some(new.generate_id()),
            privileges: new.normalized_privileges()?,
            ..new
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn delete(&self, client: &Client, state: &Value) -> Result<()> {
        let grant: Grant = decode_model(state)?;
        let version = client.version().await?;
        let mut tx = client.begin(Some(&grant.database)).await?;
        if !grant.role.eq_ignore_ascii_case("public") {
            sql::lock_role(&mut tx, &grant.role).await?;
        }
        sql::exec(&mut tx, &revoke_all_statement(&grant, version)?)
            .await
            .with_context(|| format!("Failed to revoke privileges of {:?}", grant.role))?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit revoke for {:?}", grant.role))?;
        info!(role = %grant.role, object_type = %grant.object_type, "Revoked privileges");
        Ok(())
    }

    async fn exists(&self, client: &Client, state: &Value) -> Result<bool> {
        let grant: Grant = decode_model(state)?;
        let mut conn = client.acquire(None).await?;
        Ok(sql::database_exists(&mut conn, &grant.database).await?
            && sql::role_exists(&mut conn, &grant.role).await?)
    }

    fn import_state(&self, _id: &str) -> Result<Value> {
        Err(ProviderError::ImportNotSupported("postgresql_grant").into())
    }
}

// ─── Statements ──────────────────────────────────────────────────────────────

/// Quote `name(args)` as a routine reference: the name is quoted, the
/// argument list is passed through.
fn routine_ref(schema: &str, object: &str) -> String {
    match object.split_once('(') {
        Some((name, args)) => format!("{}({}", qualified(schema, name), args),
        None => qualified(schema, object),
    }
}

/// The `ON ...` target of a grant or revoke.
pub fn target_clause(grant: &Grant, version: ServerVersion) -> Result<String> {
    let kind = grant.kind()?;
    let schema = grant.schema.as_deref().unwrap_or("public");
    let objects = &grant.objects;

    if matches!(kind, ObjectType::Procedure | ObjectType::Routine) {
        version.require(Feature::Procedure)?;
    }
    if kind.needs_schema() && kind != ObjectType::Column && objects.is_empty() {
        version.require(Feature::Privileges)?;
        return Ok(format!(
            "ALL {} IN SCHEMA {}",
            kind.plural_keyword().unwrap_or_default(),
            ident(schema)
        ));
    }

    Ok(match kind {
        ObjectType::Database => format!("DATABASE {}", ident(&grant.database)),
        ObjectType::Schema => format!("SCHEMA {}", ident(schema)),
        ObjectType::Table | ObjectType::Column => {
            format!("TABLE {}", join_objects(objects, |o| qualified(schema, o)))
        }
        ObjectType::Sequence => {
            format!("SEQUENCE {}", join_objects(objects, |o| qualified(schema, o)))
        }
        ObjectType::Function => {
            format!("FUNCTION {}", join_objects(objects, |o| routine_ref(schema, o)))
        }
        ObjectType::Procedure => {
            format!("PROCEDURE {}", join_objects(objects, |o| routine_ref(schema, o)))
        }
        ObjectType::Routine => {
            format!("ROUTINE {}", join_objects(objects, |o| routine_ref(schema, o)))
        }
        ObjectType::ForeignDataWrapper => {
            format!("FOREIGN DATA WRAPPER {}", join_objects(objects, ident))
        }
        ObjectType::ForeignServer => format!("FOREIGN SERVER {}", join_objects(objects, ident)),
        ObjectType::Type => {
            return Err(ProviderError::invalid("object_type", "unsupported for grants").into())
        }
    })
}

fn join_objects(objects: &BTreeSet<String>, quote: impl Fn(&str) -> String) -> String {
    objects
        .iter()
        .map(|o| quote(o))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Privilege list, with the column list attached for column grants.
fn privilege_clause(grant: &Grant, privileges: &BTreeSet<String>) -> Result<String> {
    if grant.kind()? == ObjectType::Column {
        let columns = sql::ident_list(grant.columns.iter().map(String::as_str));
        Ok(privileges
            .iter()
            .map(|p| format!("{} ({})", p, columns))
            .collect::<Vec<_>>()
            .join(", "))
    } else {
        Ok(privileges::privilege_list(privileges))
    }
}

pub fn grant_statement(
    grant: &Grant,
    privileges: &BTreeSet<String>,
    version: ServerVersion,
) -> Result<String> {
    let mut statement = format!(
        "GRANT {} ON {} TO {}",
        privilege_clause(grant, privileges)?,
        target_clause(grant, version)?,
        grantee(&grant.role)
    );
    if grant.with_grant_option {
        statement.push_str(" WITH GRANT OPTION");
    }
    Ok(statement)
}

pub fn revoke_statement(
    grant: &Grant,
    privileges: &BTreeSet<String>,
    version: ServerVersion,
) -> Result<String> {
    Ok(format!(
        "REVOKE {} ON {} FROM {}",
        privilege_clause(grant, privileges)?,
        target_clause(grant, version)?,
        grantee(&grant.role)
    ))
}

/// Revoke everything the role holds on the target.
pub fn revoke_all_statement(grant: &Grant, version: ServerVersion) -> Result<String> {
    let kind = grant.kind()?;
    let all = if kind == ObjectType::Column {
        kind.concrete_privileges()
            .iter()
            .map(|p| p.to_string())
            .collect()
    } else {
        BTreeSet::from(["ALL".to_string()])
    };
    revoke_statement(grant, &all, version)
}

/// Grant what was added, revoke what was removed. A change of
/// `with_grant_option` revokes everything and grants the full set again.
pub fn update_statements(old: &Grant, new: &Grant, version: ServerVersion) -> Result<Vec<String>> {
    let kind = new.kind()?;
    let planned = new.normalized_privileges()?;

    if old.with_grant_option != new.with_grant_option {
        let mut statements = vec![revoke_all_statement(new, version)?];
        if !planned.is_empty() {
            statements.push(grant_statement(new, &planned, version)?);
        }
        return Ok(statements);
    }

    let prior = privileges::validate_privileges(kind, &old.privileges)?;
    let diff = privileges::diff(kind, &prior, &planned);
    let mut statements = Vec::new();
    if !diff.revoke.is_empty() {
        statements.push(revoke_statement(new, &diff.revoke, version)?);
    }
    if !diff.grant.is_empty() {
        statements.push(grant_statement(new, &diff.grant, version)?);
    }
    Ok(statements)
}

// ─── Reading ACLs ────────────────────────────────────────────────────────────

/// One row of [`acl_query`]: object name, privilege and grantable flag.
/// Objects where the role holds nothing come back once with NULLs.
pub type AclRow = (String, Option<String>, Option<bool>);

/// Query returning [`AclRow`]s for the role in $1 over every object of the
/// kind in scope. $2 is the schema and $3 the object name where the object
/// type needs one.
pub fn acl_query(kind: ObjectType, version: ServerVersion) -> Result<String> {
    let grantee_oid = "CASE WHEN $1 = 'public' THEN 0::oid \
                       ELSE (SELECT oid FROM pg_catalog.pg_roles WHERE rolname = $1) END";
    let prokind = |code: &str| {
        if version.supports(Feature::Procedure) {
            format!("AND p.prokind = '{}'", code)
        } else {
            String::new()
        }
    };

    let objects = match kind {
        ObjectType::Database => "SELECT d.datname::text AS object, \
                    COALESCE(d.datacl, pg_catalog.acldefault('d', d.datdba)) AS acl \
             FROM pg_catalog.pg_database d WHERE d.datname = $3 AND $2 = $2"
            .to_string(),
        ObjectType::Schema => "SELECT n.nspname::text AS object, \
                    COALESCE(n.nspacl, pg_catalog.acldefault('n', n.nspowner)) AS acl \
             FROM pg_catalog.pg_namespace n WHERE n.nspname = $2 AND $3 = $3"
            .to_string(),
        ObjectType::Table | ObjectType::Sequence => {
            let relkinds = if kind == ObjectType::Table {
                "('r', 'v', 'm', 'f', 'p')"
            } else {
                "('S')"
            };
            let acl_kind = if kind == ObjectType::Table { "r" } else { "s" };
            format!(
                "SELECT c.relname::text AS object, \
                        COALESCE(c.relacl, pg_catalog.acldefault('{}', c.relowner)) AS acl \
                 FROM pg_catalog.pg_class c \
                 JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $2 AND c.relkind IN {} AND $3 = $3",
                acl_kind, relkinds
            )
        }
        ObjectType::Function | ObjectType::Procedure | ObjectType::Routine => {
            let filter = match kind {
                ObjectType::Function => prokind("f"),
                ObjectType::Procedure => prokind("p"),
                _ => String::new(),
            };
            format!(
                "SELECT p.proname::text AS object, \
                        COALESCE(p.proacl, pg_catalog.acldefault('f', p.proowner)) AS acl \
                 FROM pg_catalog.pg_proc p \
                 JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace \
                 WHERE n.nspname = $2 {} AND $3 = $3",
                filter
            )
        }
        ObjectType::ForeignDataWrapper => "SELECT f.fdwname::text AS object, \
                    COALESCE(f.fdwacl, pg_catalog.acldefault('F', f.fdwowner)) AS acl \
             FROM pg_catalog.pg_foreign_data_wrapper f WHERE $2 = $2 AND $3 = $3"
            .to_string(),
        ObjectType::ForeignServer => "SELECT s.srvname::text AS object, \
                    COALESCE(s.srvacl, pg_catalog.acldefault('S', s.srvowner)) AS acl \
             FROM pg_catalog.pg_foreign_server s WHERE $2 = $2 AND $3 = $3"
            .to_string(),
        ObjectType::Column => "SELECT a.attname::text AS object, a.attacl AS acl \
             FROM pg_catalog.pg_attribute a \
             JOIN pg_catalog.pg_class c ON c.oid = a.attrelid \
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = $2 AND c.relname = $3 AND a.attnum > 0 AND NOT a.attisdropped"
            .to_string(),
        ObjectType::Type => {
            return Err(ProviderError::invalid("object_type", "unsupported for grants").into())
        }
    };

    Ok(format!(
        "SELECT o.object, acl.privilege_type::text, acl.is_grantable FROM ({}) o \
         LEFT JOIN LATERAL pg_catalog.aclexplode(o.acl) acl ON acl.grantee = ({})",
        objects, grantee_oid
    ))
}

/// Object name bound as $3 in [`acl_query`].
fn acl_target_name(grant: &Grant) -> String {
    match grant.kind() {
        Ok(ObjectType::Database) => grant.database.clone(),
        Ok(ObjectType::Column) => grant.objects.iter().next().cloned().unwrap_or_default(),
        _ => String::new(),
    }
}

/// Fold ACL rows into the privileges held on every targeted object and
/// whether all of those are grantable. `None` when there is nothing to inspect.
pub fn summarize_acl(
    grant: &Grant,
    rows: &[AclRow],
) -> (Option<BTreeSet<String>>, Option<bool>) {
    let mut per_object: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    // A privilege may arrive from several grantors; one grantable row is enough.
    let mut grantable_on: BTreeMap<(&str, &str), bool> = BTreeMap::new();
    for (object, privilege, grantable) in rows {
        let held = per_object.entry(object.as_str()).or_default();
        if let Some(privilege) = privilege {
            held.insert(privilege.clone());
            *grantable_on
                .entry((object.as_str(), privilege.as_str()))
                .or_default() |= grantable.unwrap_or(false);
        }
    }

    // Objects the grant is about. Columns and named objects are explicit;
    // otherwise every object of the kind is in scope.
    let targets: Vec<&str> = match grant.kind() {
        Ok(ObjectType::Column) => grant.columns.iter().map(String::as_str).collect(),
        Ok(kind) if kind.takes_objects() && !grant.objects.is_empty() => grant
            .objects
            .iter()
            .map(|o| o.split('(').next().unwrap_or(o))
            .collect(),
        _ => per_object.keys().copied().collect(),
    };
    if targets.is_empty() {
        return (None, None);
    }

    let sets: Vec<BTreeSet<String>> = targets
        .iter()
        .map(|t| per_object.get(t).cloned().unwrap_or_default())
        .collect();
    let granted = privileges::intersect_all(&sets);
    let grantable = (!granted.is_empty()).then(|| {
        targets.iter().all(|t| {
            granted.iter().all(|p| {
                grantable_on
                    .get(&(*t, p.as_str()))
                    .copied()
                    .unwrap_or(false)
            })
        })
    });
    (Some(granted), grantable)
}
