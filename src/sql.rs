//! SQL text helpers and small catalog queries shared by resource handlers.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use pg_escape::{quote_identifier, quote_literal};
use sqlx::{Executor, PgConnection};
use tracing::debug;

use crate::client::Session;

// ─── Quoting ─────────────────────────────────────────────────────────────────

pub fn ident(name: &str) -> String {
    quote_identifier(name).into_owned()
}

pub fn literal(value: &str) -> String {
    quote_literal(value)
}

/// `schema.name` with both parts quoted as needed.
pub fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", ident(schema), ident(name))
}

/// Split `schema.table` on the first dot; a bare name lands in `public`.
pub fn split_qualified(name: &str) -> (&str, &str) {
    match name.split_once('.') {
        Some((schema, table)) => (schema, table),
        None => ("public", name),
    }
}

pub fn ident_list<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names.into_iter().map(ident).collect::<Vec<_>>().join(", ")
}

/// Role name as a grantee. `public` is the PUBLIC pseudo-role.
pub fn grantee(role: &str) -> String {
    if role.eq_ignore_ascii_case("public") {
        "PUBLIC".to_string()
    } else {
        ident(role)
    }
}

// ─── Options (k=v lists) ─────────────────────────────────────────────────────

/// Parse catalog option arrays such as `srvoptions` (`{host=db1,port=5432}`).
pub fn parse_options(entries: &[String]) -> BTreeMap<String, String> {
    entries
        .iter()
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// `OPTIONS (...)` clause for CREATE statements, or an empty string.
pub fn create_options_clause(options: &BTreeMap<String, String>) -> String {
    if options.is_empty() {
        return String::new();
    }
    let items = options
        .iter()
        .map(|(k, v)| format!("{} {}", ident(k), literal(v)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(" OPTIONS ({})", items)
}

/// `OPTIONS (ADD/SET/DROP ...)` clause moving `prior` to `planned`, or None
/// when they are equal.
pub fn alter_options_clause(
    prior: &BTreeMap<String, String>,
    planned: &BTreeMap<String, String>,
) -> Option<String> {
    let mut items = Vec::new();
    for (k, v) in planned {
        match prior.get(k) {
            None => items.push(format!("ADD {} {}", ident(k), literal(v))),
            Some(old) if old != v => items.push(format!("SET {} {}", ident(k), literal(v))),
            Some(_) => {}
        }
    }
    for k in prior.keys().filter(|k| !planned.contains_key(*k)) {
        items.push(format!("DROP {}", ident(k)));
    }
    if items.is_empty() {
        None
    } else {
        Some(format!("OPTIONS ({})", items.join(", ")))
    }
}

// ─── Execution ───────────────────────────────────────────────────────────────

/// Run one statement over the simple query protocol.
pub async fn exec(conn: &mut PgConnection, statement: &str) -> Result<()> {
    debug!(statement, "Executing");
    (&mut *conn)
        .execute(statement)
        .await
        .with_context(|| format!("Failed to execute: {}", statement))?;
    Ok(())
}

pub async fn exec_all(conn: &mut PgConnection, statements: &[String]) -> Result<()> {
    for statement in statements {
        exec(conn, statement).await?;
    }
    Ok(())
}

/// Serialize concurrent changes touching the same role for the rest of the
/// transaction.
pub async fn lock_role(conn: &mut PgConnection, role: &str) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(oid::bigint) FROM pg_catalog.pg_roles WHERE rolname = $1")
        .bind(role)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("Failed to lock role {:?}", role))?;
    Ok(())
}

// ─── Catalog Lookups ─────────────────────────────────────────────────────────

pub async fn role_exists(conn: &mut PgConnection, role: &str) -> Result<bool> {
    if role.eq_ignore_ascii_case("public") {
        return Ok(true);
    }
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_roles WHERE rolname = $1)",
    )
    .bind(role)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("Failed to look up role {:?}", role))?;
    Ok(exists)
}

pub async fn database_exists(conn: &mut PgConnection, database: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_database WHERE datname = $1)",
    )
    .bind(database)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("Failed to look up database {:?}", database))?;
    Ok(exists)
}

pub async fn schema_exists(conn: &mut PgConnection, schema: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1)",
    )
    .bind(schema)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("Failed to look up schema {:?}", schema))?;
    Ok(exists)
}

// ─── Temporary Membership ────────────────────────────────────────────────────

/// Make the session user a member of `role` so it can create objects owned
/// by `role` or alter that role's default privileges. Superusers need
/// nothing. Returns the role to hand to [`release_membership`].
pub async fn ensure_membership(
    conn: &mut PgConnection,
    session: &Session,
    role: &str,
) -> Result<Option<String>> {
    if session.superuser || role == session.current_user {
        return Ok(None);
    }
    let is_member: bool = sqlx::query_scalar("SELECT pg_catalog.pg_has_role($1, $2, 'member')")
        .bind(&session.current_user)
        .bind(role)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("Failed to check membership in role {:?}", role))?;
    if is_member {
        return Ok(None);
    }

    debug!(role, member = %session.current_user, "Granting temporary membership");
    exec(
        conn,
        &format!("GRANT {} TO {}", ident(role), ident(&session.current_user)),
    )
    .await?;
    Ok(Some(role.to_string()))
}

pub async fn release_membership(
    conn: &mut PgConnection,
    session: &Session,
    granted: Option<String>,
) -> Result<()> {
    if let Some(role) = granted {
        debug!(role = %role, member = %session.current_user, "Revoking temporary membership");
        exec(
            conn,
            &format!("REVOKE {} FROM {}", ident(&role), ident(&session.current_user)),
        )
        .await?;
    }
    Ok(())
}
