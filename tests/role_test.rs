use std::collections::BTreeSet;

use pgprovider::client::version::ServerVersion;
use pgprovider::resources::role::{
    create_statement, drop_owned_statements, parse_role_config, settings_statements,
    update_statements, Role, RoleResource, RoleSettings,
};
use pgprovider::resources::{decode_model, Resource};
use serde_json::json;

const PG15: ServerVersion = ServerVersion::new(150000);

fn app_role() -> Role {
    decode_model(&json!({"name": "app", "login": true})).unwrap()
}

// ─── Create ──────────────────────────────────────────────────────────────────

#[test]
fn test_model_defaults_match_postgres_defaults() {
    let role = app_role();
    assert!(role.inherit);
    assert!(role.encrypted_password);
    assert!(!role.superuser);
    assert!(role.roles.is_empty());
}

#[test]
fn test_create_statement_spells_out_every_option() {
    let role = Role {
        password: Some("s3cret".to_string()),
        connection_limit: Some(5),
        ..app_role()
    };
    assert_eq!(
        create_statement(&role, PG15).unwrap(),
        "CREATE ROLE app WITH NOSUPERUSER NOCREATEDB NOCREATEROLE INHERIT LOGIN \
         NOREPLICATION NOBYPASSRLS CONNECTION LIMIT 5 VALID UNTIL 'infinity' \
         ENCRYPTED PASSWORD 's3cret'"
    );
}

#[test]
fn test_old_servers_skip_newer_options() {
    let statement = create_statement(&app_role(), ServerVersion::new(90000)).unwrap();
    assert!(!statement.contains("REPLICATION"));
    assert!(!statement.contains("BYPASSRLS"));
    assert!(!statement.contains("PASSWORD"));

    let bypass = Role {
        bypass_row_level_security: true,
        ..app_role()
    };
    assert!(create_statement(&bypass, ServerVersion::new(90400)).is_err());
}

// ─── Update ──────────────────────────────────────────────────────────────────

#[test]
fn test_rename_comes_first_and_resets_password() {
    let old = Role {
        password: Some("s3cret".to_string()),
        ..app_role()
    };
    let new = Role {
        name: "service".to_string(),
        ..old.clone()
    };
    assert_eq!(
        update_statements(&old, &new, PG15).unwrap(),
        vec![
            "ALTER ROLE app RENAME TO service".to_string(),
            "ALTER ROLE service WITH ENCRYPTED PASSWORD 's3cret'".to_string(),
        ]
    );
}

#[test]
fn test_membership_changes() {
    let old = Role {
        roles: ["reader", "writer"].iter().map(|s| s.to_string()).collect(),
        ..app_role()
    };
    let new = Role {
        roles: ["reader", "auditor"].iter().map(|s| s.to_string()).collect(),
        ..app_role()
    };
    assert_eq!(
        update_statements(&old, &new, PG15).unwrap(),
        vec![
            "GRANT auditor TO app".to_string(),
            "REVOKE writer FROM app".to_string(),
        ]
    );
}

#[test]
fn test_removed_password_is_nulled() {
    let old = Role {
        password: Some("s3cret".to_string()),
        ..app_role()
    };
    assert_eq!(
        update_statements(&old, &app_role(), PG15).unwrap(),
        vec!["ALTER ROLE app WITH PASSWORD NULL".to_string()]
    );
}

#[test]
fn test_option_change_rewrites_options() {
    let new = Role {
        create_database: true,
        ..app_role()
    };
    let statements = update_statements(&app_role(), &new, PG15).unwrap();
    assert_eq!(statements.len(), 1);
    assert!(statements[0].starts_with("ALTER ROLE app WITH NOSUPERUSER CREATEDB"));
}

// ─── Settings ────────────────────────────────────────────────────────────────

#[test]
fn test_settings_set_and_reset() {
    let old = RoleSettings {
        statement_timeout: 1000,
        assume_role: "owner".to_string(),
        ..Default::default()
    };
    let new = RoleSettings {
        search_path: vec!["analytics".to_string(), "public".to_string()],
        idle_in_transaction_session_timeout: 60000,
        ..Default::default()
    };
    assert_eq!(
        settings_statements("app", &old, &new),
        vec![
            "ALTER ROLE app SET search_path TO analytics, public".to_string(),
            "ALTER ROLE app RESET statement_timeout".to_string(),
            "ALTER ROLE app SET idle_in_transaction_session_timeout TO 60000".to_string(),
            "ALTER ROLE app RESET role".to_string(),
        ]
    );
}

#[test]
fn test_parse_role_config_units() {
    let settings = parse_role_config(&[
        "search_path=analytics, \"$user\"".to_string(),
        "statement_timeout=5s".to_string(),
        "idle_in_transaction_session_timeout=2min".to_string(),
        "role=owner".to_string(),
        "work_mem=64MB".to_string(),
    ]);
    assert_eq!(settings.search_path, vec!["analytics", "$user"]);
    assert_eq!(settings.statement_timeout, 5000);
    assert_eq!(settings.idle_in_transaction_session_timeout, 120_000);
    assert_eq!(settings.assume_role, "owner");
}

#[test]
fn test_parse_role_config_plain_millis() {
    let settings = parse_role_config(&["statement_timeout=250".to_string()]);
    assert_eq!(settings.statement_timeout, 250);
    assert!(settings.search_path.is_empty());
}

// ─── Drop ────────────────────────────────────────────────────────────────────

#[test]
fn test_drop_owned_reassigns_first() {
    assert_eq!(
        drop_owned_statements("app", "postgres"),
        vec![
            "REASSIGN OWNED BY app TO postgres".to_string(),
            "DROP OWNED BY app".to_string(),
        ]
    );
}

// ─── Resource surface ────────────────────────────────────────────────────────

#[test]
fn test_validate_negative_limits() {
    let findings = RoleResource.validate(&json!({
        "name": "app",
        "connection_limit": -2,
        "statement_timeout": -1
    }));
    let attributes: BTreeSet<_> = findings
        .iter()
        .filter_map(|f| f.attribute.clone())
        .collect();
    assert!(attributes.contains("connection_limit"));
    assert!(attributes.contains("statement_timeout"));
}

#[test]
fn test_import_seeds_name() {
    assert_eq!(
        RoleResource.import_state("app").unwrap(),
        json!({"id": "app", "name": "app"})
    );
}
