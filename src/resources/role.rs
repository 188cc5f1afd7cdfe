use std::collections::BTreeSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{decode_model, default_true, encode_model, refresh, Resource};
use crate::client::version::{Feature, ServerVersion};
use crate::client::Client;
use crate::plugin::diagnostics::Finding;
use crate::schema::{AttrType, Attribute, Block};
use crate::sql::{self, ident, literal};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Role {
    pub id: Option<String>,
    pub name: String,
    pub superuser: bool,
    pub create_database: bool,
    pub create_role: bool,
    #[serde(default = "default_true")]
    pub inherit: bool,
    pub login: bool,
    pub replication: bool,
    pub bypass_row_level_security: bool,
    pub connection_limit: Option<i64>,
    #[serde(default = "default_true")]
    pub encrypted_password: bool,
    pub password: Option<String>,
    pub valid_until: Option<String>,
    pub roles: BTreeSet<String>,
    pub search_path: Vec<String>,
    pub statement_timeout: i64,
    pub idle_in_transaction_session_timeout: i64,
    pub assume_role: String,
    pub skip_drop_role: bool,
    pub skip_reassign_owned: bool,
}

/// Per-role settings stored in `pg_roles.rolconfig`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleSettings {
    pub search_path: Vec<String>,
    pub statement_timeout: i64,
    pub idle_in_transaction_session_timeout: i64,
    pub assume_role: String,
}

impl RoleSettings {
    fn of(role: &Role) -> Self {
        Self {
            search_path: role.search_path.clone(),
            statement_timeout: role.statement_timeout,
            idle_in_transaction_session_timeout: role.idle_in_transaction_session_timeout,
            assume_role: role.assume_role.clone(),
        }
    }
}

pub struct RoleResource;

#[async_trait]
impl Resource for RoleResource {
    fn type_name(&self) -> &'static str {
        "postgresql_role"
    }

    fn schema(&self) -> Block {
        Block::resource(
            "A PostgreSQL role (user or group).",
            vec![
                Attribute::required("name", AttrType::String).describe("The role name"),
                Attribute::with_default("superuser", AttrType::Bool, json!(false)),
                Attribute::with_default("create_database", AttrType::Bool, json!(false)),
                Attribute::with_default("create_role", AttrType::Bool, json!(false)),
                Attribute::with_default("inherit", AttrType::Bool, json!(true)),
                Attribute::with_default("login", AttrType::Bool, json!(false)),
                Attribute::with_default("replication", AttrType::Bool, json!(false)),
                Attribute::with_default("bypass_row_level_security", AttrType::Bool, json!(false)),
                Attribute::with_default("connection_limit", AttrType::Number, json!(-1)),
                Attribute::with_default("encrypted_password", AttrType::Bool, json!(true)),
                Attribute::optional("password", AttrType::String).sensitive(),
                Attribute::with_default("valid_until", AttrType::String, json!("infinity"))
                    .describe("Date and time after which the password is no longer valid"),
                Attribute::optional("roles", AttrType::set_of_strings())
                    .describe("Roles this role is granted membership in"),
                Attribute::optional("search_path", AttrType::list_of_strings()),
                Attribute::with_default("statement_timeout", AttrType::Number, json!(0))
                    .describe("Milliseconds; 0 disables the timeout"),
                Attribute::with_default(
                    "idle_in_transaction_session_timeout",
                    AttrType::Number,
                    json!(0),
                ),
                Attribute::with_default("assume_role", AttrType::String, json!(""))
                    .describe("Role to switch to on login"),
                Attribute::with_default("skip_drop_role", AttrType::Bool, json!(false)),
                Attribute::with_default("skip_reassign_owned", AttrType::Bool, json!(false)),
            ],
        )
    }

    fn validate(&self, config: &Value) -> Vec<Finding> {
        let mut findings = Vec::new();
        for attr in ["statement_timeout", "idle_in_transaction_session_timeout"] {
            if config.get(attr).and_then(Value::as_i64).is_some_and(|v| v < 0) {
                findings.push(Finding::error(format!("{} must not be negative", attr)).at(attr));
            }
        }
        if config
            .get("connection_limit")
            .and_then(Value::as_i64)
            .is_some_and(|v| v < -1)
        {
            findings.push(
                Finding::error("connection_limit must be -1 or greater").at("connection_limit"),
            );
        }
        findings
    }

    async fn create(&self, client: &Client, planned: &Value) -> Result<Value> {
        let role: Role = decode_model(planned)?;
        let version = client.version().await?;

        let mut statements = vec![create_statement(&role, version)?];
        statements.extend(
            role.roles
                .iter()
                .map(|member_of| format!("GRANT {} TO {}", ident(member_of), ident(&role.name))),
        );
        statements.extend(settings_statements(
            &role.name,
            &RoleSettings::default(),
            &RoleSettings::of(&role),
        ));

        let mut tx = client.begin(None).await?;
        sql::exec_all(&mut tx, &statements)
            .await
            .with_context(|| format!("Failed to create role {:?}", role.name))?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit role {:?}", role.name))?;

        info!(role = %role.name, "Created role");
        let state = Role {
            id: Some(role.name.clone()),
            ..role
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn read(&self, client: &Client, state: &Value) -> Result<Option<Value>> {
        let prior: Role = decode_model(state)?;
        let version = client.version().await?;
        let bypass = if version.supports(Feature::BypassRowLevelSecurity) {
            "r.rolbypassrls"
        } else {
            "false"
        };
        let query = format!(
            "SELECT r.rolsuper, r.rolinherit, r.rolcreaterole, r.rolcreatedb, r.rolcanlogin, \
                    r.rolreplication, r.rolconnlimit, \
                    COALESCE(r.rolvaliduntil::text, 'infinity'), {}, \
                    ARRAY(SELECT g.rolname::text FROM pg_catalog.pg_auth_members m \
                          JOIN pg_catalog.pg_roles g ON g.oid = m.roleid \
                          WHERE m.member = r.oid), \
                    COALESCE(r.rolconfig, ARRAY[]::text[]) \
             FROM pg_catalog.pg_roles r WHERE r.rolname = $1",
            bypass
        );

        let mut conn = client.acquire(None).await?;
        type RoleRow = (
            bool,
            bool,
            bool,
            bool,
            bool,
            bool,
            i32,
            String,
            bool,
            Vec<String>,
            Vec<String>,
        );
        let row: Option<RoleRow> = sqlx::query_as(&query)
            .bind(&prior.name)
            .fetch_optional(&mut *conn)
            .await
            .with_context(|| format!("Failed to read role {:?}", prior.name))?;
        let Some((
            superuser,
            inherit,
            create_role,
            create_database,
            login,
            replication,
            limit,
            valid_until,
            bypass_rls,
            member_of,
            config,
        )) = row
        else {
            return Ok(None);
        };

        let settings = parse_role_config(&config);
        let current = Role {
            id: Some(prior.name.clone()),
            superuser,
            create_database,
            create_role,
            inherit,
            login,
            replication,
            bypass_row_level_security: bypass_rls,
            connection_limit: Some(limit as i64),
            valid_until: Some(valid_until),
            roles: member_of.into_iter().collect(),
            search_path: settings.search_path,
            statement_timeout: settings.statement_timeout,
            idle_in_transaction_session_timeout: settings.idle_in_transaction_session_timeout,
            assume_role: settings.assume_role,
            // The catalog never returns passwords; flags are provider-side only.
            ..prior
        };
        Ok(Some(encode_model(&current)?))
    }

    async fn update(&self, client: &Client, prior: &Value, planned: &Value) -> Result<Value> {
        let old: Role = decode_model(prior)?;
        let new: Role = decode_model(planned)?;
        let version = client.version().await?;
        let statements = update_statements(&old, &new, version)?;

        let mut tx = client.begin(None).await?;
        sql::lock_role(&mut tx, &old.name).await?;
        sql::exec_all(&mut tx, &statements)
            .await
            .with_context(|| format!("Failed to update role {:?}", new.name))?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit role {:?}", new.name))?;

        let state = Role {
            id: Some(new.name.clone()),
            ..new
        };
        refresh(self, client, &encode_model(&state)?).await
    }

    async fn delete(&self, client: &Client, state: &Value) -> Result<()> {
        let role: Role = decode_model(state)?;
        let session = client.session().await?;

        if !role.skip_reassign_owned {
            // Ownership is per database, so clean up in every database that
            // accepts connections.
            let databases: Vec<String> = {
                let mut conn = client.acquire(None).await?;
                sqlx::query_scalar(
                    "SELECT datname::text FROM pg_catalog.pg_database \
                     WHERE datallowconn AND NOT datistemplate",
                )
                .fetch_all(&mut *conn)
                .await
                .context("Failed to list databases")?
            };
            for database in databases {
                debug!(role = %role.name, database = %database, "Reassigning owned objects");
                let mut tx = client.begin(Some(&database)).await?;
                let membership = sql::ensure_membership(&mut tx, session, &role.name).await?;
                sql::exec_all(&mut tx, &drop_owned_statements(&role.name, &session.current_user))
                    .await
                    .with_context(|| {
                        format!(
                            "Failed to reassign objects owned by {:?} in {:?}",
                            role.name, database
                        )
                    })?;
                sql::release_membership(&mut tx, session, membership).await?;
                tx.commit().await.with_context(|| {
                    format!("Failed to commit cleanup of {:?} in {:?}", role.name, database)
                })?;
            }
        }

        if role.skip_drop_role {
            info!(role = %role.name, "Leaving role in place (skip_drop_role)");
            return Ok(());
        }

        let mut tx = client.begin(None).await?;
        sql::lock_role(&mut tx, &role.name).await?;
        sql::exec(&mut tx, &format!("DROP ROLE {}", ident(&role.name)))
            .await
            .with_context(|| format!("Failed to drop role {:?}", role.name))?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit drop of role {:?}", role.name))?;
        info!(role = %role.name, "Dropped role");
        Ok(())
    }

    async fn exists(&self, client: &Client, state: &Value) -> Result<bool> {
        let role: Role = decode_model(state)?;
        let mut conn = client.acquire(None).await?;
        sql::role_exists(&mut conn, &role.name).await
    }

    fn import_state(&self, id: &str) -> Result<Value> {
        Ok(json!({ "id": id, "name": id }))
    }
}

/// `SUPERUSER NOCREATEDB ... CONNECTION LIMIT n VALID UNTIL '...'`
pub fn role_options(role: &Role, version: ServerVersion) -> Result<Vec<String>> {
    let flag = |on: bool, yes: &str, no: &str| (if on { yes } else { no }).to_string();
    let mut options = vec![
        flag(role.superuser, "SUPERUSER", "NOSUPERUSER"),
        flag(role.create_database, "CREATEDB", "NOCREATEDB"),
        flag(role.create_role, "CREATEROLE", "NOCREATEROLE"),
        flag(role.inherit, "INHERIT", "NOINHERIT"),
        flag(role.login, "LOGIN", "NOLOGIN"),
    ];
    if version.supports(Feature::Replication) {
        options.push(flag(role.replication, "REPLICATION", "NOREPLICATION"));
    } else if role.replication {
        version.require(Feature::Replication)?;
    }
    if version.supports(Feature::BypassRowLevelSecurity) {
        options.push(flag(role.bypass_row_level_security, "BYPASSRLS", "NOBYPASSRLS"));
    } else if role.bypass_row_level_security {
        version.require(Feature::BypassRowLevelSecurity)?;
    }
    options.push(format!("CONNECTION LIMIT {}", role.connection_limit.unwrap_or(-1)));
    options.push(format!(
        "VALID UNTIL {}",
        literal(role.valid_until.as_deref().unwrap_or("infinity"))
    ));
    Ok(options)
}

fn password_clause(role: &Role) -> String {
    match &role.password {
        Some(password) if role.encrypted_password => {
            format!("ENCRYPTED PASSWORD {}", literal(password))
        }
        Some(password) => format!("PASSWORD {}", literal(password)),
        None => "PASSWORD NULL".to_string(),
    }
}

pub fn create_statement(role: &Role, version: ServerVersion) -> Result<String> {
    version.require(Feature::CreateRoleWith)?;
    let mut options = role_options(role, version)?;
    if role.password.is_some() {
        options.push(password_clause(role));
    }
    Ok(format!(
        "CREATE ROLE {} WITH {}",
        ident(&role.name),
        options.join(" ")
    ))
}

pub fn update_statements(old: &Role, new: &Role, version: ServerVersion) -> Result<Vec<String>> {
    let mut statements = Vec::new();
    let name = ident(&new.name);
    if old.name != new.name {
        statements.push(format!("ALTER ROLE {} RENAME TO {}", ident(&old.name), name));
    }

    let old_options = role_options(old, version)?;
    let new_options = role_options(new, version)?;
    if old_options != new_options {
        statements.push(format!("ALTER ROLE {} WITH {}", name, new_options.join(" ")));
    }
    // A rename clears MD5 passwords, so set it again.
    if old.password != new.password
        || old.encrypted_password != new.encrypted_password
        || (old.name != new.name && new.password.is_some())
    {
        statements.push(format!("ALTER ROLE {} WITH {}", name, password_clause(new)));
    }

    for granted in new.roles.difference(&old.roles) {
        statements.push(format!("GRANT {} TO {}", ident(granted), name));
    }
    for revoked in old.roles.difference(&new.roles) {
        statements.push(format!("REVOKE {} FROM {}", ident(revoked), name));
    }

    statements.extend(settings_statements(
        &new.name,
        &RoleSettings::of(old),
        &RoleSettings::of(new),
    ));
    Ok(statements)
}

/// `ALTER ROLE ... SET/RESET` for every setting that changed.
pub fn settings_statements(name: &str, old: &RoleSettings, new: &RoleSettings) -> Vec<String> {
    let name = ident(name);
    let mut statements = Vec::new();

    if old.search_path != new.search_path {
        statements.push(if new.search_path.is_empty() {
            format!("ALTER ROLE {} RESET search_path", name)
        } else {
            format!(
                "ALTER ROLE {} SET search_path TO {}",
                name,
                sql::ident_list(new.search_path.iter().map(String::as_str))
            )
        });
    }
    for (setting, old_ms, new_ms) in [
        ("statement_timeout", old.statement_timeout, new.statement_timeout),
        (
            "idle_in_transaction_session_timeout",
            old.idle_in_transaction_session_timeout,
            new.idle_in_transaction_session_timeout,
        ),
    ] {
        if old_ms != new_ms {
            statements.push(if new_ms == 0 {
                format!("ALTER ROLE {} RESET {}", name, setting)
            } else {
                format!("ALTER ROLE {} SET {} TO {}", name, setting, new_ms)
            });
        }
    }
    if old.assume_role != new.assume_role {
        statements.push(if new.assume_role.is_empty() {
            format!("ALTER ROLE {} RESET role", name)
        } else {
            format!("ALTER ROLE {} SET role TO {}", name, ident(&new.assume_role))
        });
    }
    statements
}

/// Parse `rolconfig` entries such as `search_path=app, "$user"`.
pub fn parse_role_config(entries: &[String]) -> RoleSettings {
    let mut settings = RoleSettings::default();
    for entry in entries {
        let Some((key, value)) = entry.split_once('=') else {
            continue;
        };
        match key {
            "search_path" => {
                settings.search_path = value
                    .split(',')
                    .map(|s| s.trim().trim_matches('"').to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "statement_timeout" => settings.statement_timeout = parse_millis(value),
            "idle_in_transaction_session_timeout" => {
                settings.idle_in_transaction_session_timeout = parse_millis(value)
            }
            "role" => settings.assume_role = value.to_string(),
            _ => {}
        }
    }
    settings
}

/// Timeouts are stored as given (`1000`) or with a unit (`5s`, `1min`).
fn parse_millis(value: &str) -> i64 {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let Ok(number) = number.parse::<i64>() else {
        return 0;
    };
    match unit.trim() {
        "" | "ms" => number,
        "s" => number * 1000,
        "min" => number * 60_000,
        "h" => number * 3_600_000,
        "d" => number * 86_400_000,
        _ => number,
    }
}

pub fn drop_owned_statements(role: &str, new_owner: &str) -> Vec<String> {
    vec![
        format!("REASSIGN OWNED BY {} TO {}", ident(role), ident(new_owner)),
        format!("DROP OWNED BY {}", ident(role)),
    ]
}
