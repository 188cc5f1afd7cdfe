use std::collections::BTreeSet;

use pgprovider::client::version::ServerVersion;
use pgprovider::error::ProviderError;
use pgprovider::resources::grant::{
    acl_query, grant_statement, revoke_all_statement, summarize_acl, target_clause,
    update_statements, AclRow, Grant, GrantResource,
};
use pgprovider::resources::privileges::{normalize_read, ObjectType};
use pgprovider::resources::Resource;
use serde_json::json;

const PG15: ServerVersion = ServerVersion::new(150000);

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn table_grant() -> Grant {
    Grant {
        role: "reader".to_string(),
        database: "app".to_string(),
        schema: Some("analytics".to_string()),
        object_type: "table".to_string(),
        objects: set(&["events", "users"]),
        privileges: set(&["SELECT"]),
        ..Default::default()
    }
}

fn invalid_attribute(result: Result<(), ProviderError>) -> String {
    match result {
        Err(ProviderError::InvalidAttribute { attribute, .. }) => attribute,
        other => panic!("expected invalid attribute, got {:?}", other),
    }
}

// ─── Checks ──────────────────────────────────────────────────────────────────

#[test]
fn test_valid_table_grant_passes() {
    assert!(table_grant().check().is_ok());
}

#[test]
fn test_schema_required_for_tables() {
    let grant = Grant {
        schema: None,
        ..table_grant()
    };
    assert_eq!(invalid_attribute(grant.check()), "schema");
}

#[test]
fn test_database_grant_rejects_schema_and_objects() {
    let with_schema = Grant {
        object_type: "database".to_string(),
        objects: BTreeSet::new(),
        privileges: set(&["CONNECT"]),
        ..table_grant()
    };
    assert_eq!(invalid_attribute(with_schema.check()), "schema");

    let with_objects = Grant {
        object_type: "database".to_string(),
        schema: None,
        privileges: set(&["CONNECT"]),
        ..table_grant()
    };
    assert_eq!(invalid_attribute(with_objects.check()), "objects");
}

#[test]
fn test_column_grant_needs_one_table_and_columns() {
    let column = Grant {
        object_type: "column".to_string(),
        objects: set(&["users"]),
        columns: set(&["email"]),
        ..table_grant()
    };
    assert!(column.check().is_ok());

    let two_tables = Grant {
        objects: set(&["users", "events"]),
        ..column.clone()
    };
    assert_eq!(invalid_attribute(two_tables.check()), "objects");

    let no_columns = Grant {
        columns: BTreeSet::new(),
        ..column
    };
    assert_eq!(invalid_attribute(no_columns.check()), "columns");
}

#[test]
fn test_wrong_privilege_is_reported() {
    let grant = Grant {
        privileges: set(&["USAGE"]),
        ..table_grant()
    };
    assert_eq!(invalid_attribute(grant.check()), "privileges");
}

#[test]
fn test_generated_id() {
    assert_eq!(
        table_grant().generate_id(),
        "reader_app_analytics_table_events_users"
    );
    let database = Grant {
        role: "reader".to_string(),
        database: "app".to_string(),
        object_type: "database".to_string(),
        ..Default::default()
    };
    assert_eq!(database.generate_id(), "reader_app_database");
}

// ─── Statements ──────────────────────────────────────────────────────────────

#[test]
fn test_grant_on_named_tables() {
    let statement = grant_statement(&table_grant(), &set(&["SELECT"]), PG15).unwrap();
    assert_eq!(
        statement,
        "GRANT SELECT ON TABLE analytics.events, analytics.users TO reader"
    );
}

#[test]
fn test_grant_on_all_tables_in_schema() {
    let grant = Grant {
        objects: BTreeSet::new(),
        with_grant_option: true,
        ..table_grant()
    };
    let statement = grant_statement(&grant, &set(&["ALL"]), PG15).unwrap();
    assert_eq!(
        statement,
        "GRANT ALL PRIVILEGES ON ALL TABLES IN SCHEMA analytics TO reader WITH GRANT OPTION"
    );
}

#[test]
fn test_grant_to_public() {
    let grant = Grant {
        role: "public".to_string(),
        object_type: "schema".to_string(),
        objects: BTreeSet::new(),
        privileges: set(&["USAGE"]),
        ..table_grant()
    };
    assert_eq!(
        grant_statement(&grant, &set(&["USAGE"]), PG15).unwrap(),
        "GRANT USAGE ON SCHEMA analytics TO PUBLIC"
    );
}

#[test]
fn test_function_target_keeps_signature() {
    let grant = Grant {
        object_type: "function".to_string(),
        objects: set(&["rollup(integer)"]),
        ..table_grant()
    };
    assert_eq!(
        target_clause(&grant, PG15).unwrap(),
        "FUNCTION analytics.rollup(integer)"
    );
}

#[test]
fn test_procedures_need_pg11() {
    let grant = Grant {
        object_type: "procedure".to_string(),
        objects: set(&["cleanup()"]),
        ..table_grant()
    };
    assert!(target_clause(&grant, ServerVersion::new(100000)).is_err());
    assert!(target_clause(&grant, PG15).is_ok());
}

#[test]
fn test_column_revoke_all_lists_concrete_privileges() {
    let grant = Grant {
        object_type: "column".to_string(),
        objects: set(&["users"]),
        columns: set(&["email", "phone"]),
        ..table_grant()
    };
    assert_eq!(
        revoke_all_statement(&grant, PG15).unwrap(),
        "REVOKE INSERT (email, phone), REFERENCES (email, phone), SELECT (email, phone), \
         UPDATE (email, phone) ON TABLE analytics.users FROM reader"
    );
}

#[test]
fn test_update_grants_and_revokes_difference() {
    let old = Grant {
        privileges: set(&["SELECT", "DELETE"]),
        ..table_grant()
    };
    let new = Grant {
        privileges: set(&["SELECT", "INSERT"]),
        ..table_grant()
    };
    assert_eq!(
        update_statements(&old, &new, PG15).unwrap(),
        vec![
            "REVOKE DELETE ON TABLE analytics.events, analytics.users FROM reader".to_string(),
            "GRANT INSERT ON TABLE analytics.events, analytics.users TO reader".to_string(),
        ]
    );
}

#[test]
fn test_update_with_grant_option_change_regrants_everything() {
    let old = table_grant();
    let new = Grant {
        with_grant_option: true,
        ..table_grant()
    };
    let statements = update_statements(&old, &new, PG15).unwrap();
    assert_eq!(statements.len(), 2);
    assert!(statements[0].starts_with("REVOKE ALL PRIVILEGES ON TABLE"));
    assert!(statements[1].ends_with("WITH GRANT OPTION"));
}

#[test]
fn test_update_without_changes_is_empty() {
    assert!(update_statements(&table_grant(), &table_grant(), PG15)
        .unwrap()
        .is_empty());
}

// ─── ACL reading ─────────────────────────────────────────────────────────────

#[test]
fn test_acl_query_binds_every_parameter() {
    for kind in [
        ObjectType::Database,
        ObjectType::Schema,
        ObjectType::Table,
        ObjectType::Sequence,
        ObjectType::Function,
        ObjectType::ForeignServer,
        ObjectType::Column,
    ] {
        let query = acl_query(kind, PG15).unwrap();
        for param in ["$1", "$2", "$3"] {
            assert!(query.contains(param), "{} query lacks {}", kind, param);
        }
    }
    assert!(acl_query(ObjectType::Type, PG15).is_err());
}

#[test]
fn test_prokind_filter_depends_on_version() {
    assert!(acl_query(ObjectType::Function, PG15)
        .unwrap()
        .contains("prokind = 'f'"));
    assert!(!acl_query(ObjectType::Function, ServerVersion::new(100000))
        .unwrap()
        .contains("prokind"));
}

fn row(object: &str, privilege: &str, grantable: bool) -> AclRow {
    (object.to_string(), Some(privilege.to_string()), Some(grantable))
}

fn bare(object: &str) -> AclRow {
    (object.to_string(), None, None)
}

#[test]
fn test_acl_query_lists_objects_without_privileges() {
    let query = acl_query(ObjectType::Table, PG15).unwrap();
    assert!(query.contains("LEFT JOIN LATERAL pg_catalog.aclexplode"));
}

#[test]
fn test_summarize_intersects_named_objects() {
    let rows = vec![
        row("events", "SELECT", false),
        row("events", "INSERT", false),
        row("users", "SELECT", false),
        row("other", "DELETE", true),
    ];
    let (granted, grantable) = summarize_acl(&table_grant(), &rows);
    assert_eq!(granted, Some(set(&["SELECT"])));
    assert_eq!(grantable, Some(false));
}

#[test]
fn test_grantable_ignores_objects_outside_the_grant() {
    let grant = Grant {
        objects: set(&["events"]),
        ..table_grant()
    };
    let rows = vec![row("events", "SELECT", true), row("other", "SELECT", false)];
    assert_eq!(
        summarize_acl(&grant, &rows),
        (Some(set(&["SELECT"])), Some(true))
    );
}

#[test]
fn test_grantable_only_counts_intersected_privileges() {
    let rows = vec![
        row("events", "SELECT", true),
        row("events", "INSERT", false),
        row("users", "SELECT", true),
    ];
    assert_eq!(
        summarize_acl(&table_grant(), &rows),
        (Some(set(&["SELECT"])), Some(true))
    );
}

#[test]
fn test_grantable_from_any_grantor() {
    let grant = Grant {
        objects: set(&["events"]),
        ..table_grant()
    };
    let rows = vec![row("events", "SELECT", false), row("events", "SELECT", true)];
    assert_eq!(summarize_acl(&grant, &rows).1, Some(true));
}

#[test]
fn test_summarize_object_without_privileges_yields_empty_set() {
    let rows = vec![row("events", "SELECT", true), bare("users")];
    let (granted, grantable) = summarize_acl(&table_grant(), &rows);
    assert_eq!(granted, Some(BTreeSet::new()));
    assert_eq!(grantable, None);
}

#[test]
fn test_all_in_schema_counts_ungranted_objects() {
    let grant = Grant {
        objects: BTreeSet::new(),
        ..table_grant()
    };
    let rows = vec![row("t1", "SELECT", false), bare("t2")];
    let (granted, _) = summarize_acl(&grant, &rows);
    assert_eq!(granted, Some(BTreeSet::new()));

    let fully_granted = vec![row("t1", "SELECT", false), row("t2", "SELECT", false)];
    assert_eq!(summarize_acl(&grant, &fully_granted).0, Some(set(&["SELECT"])));
}

#[test]
fn test_summarize_nothing_to_inspect() {
    let grant = Grant {
        objects: BTreeSet::new(),
        ..table_grant()
    };
    assert_eq!(summarize_acl(&grant, &[]), (None, None));
}

#[test]
fn test_pg17_all_read_keeps_all() {
    let grant = Grant {
        objects: set(&["events"]),
        privileges: set(&["ALL"]),
        ..table_grant()
    };
    let rows: Vec<AclRow> = [
        "DELETE",
        "INSERT",
        "MAINTAIN",
        "REFERENCES",
        "SELECT",
        "TRIGGER",
        "TRUNCATE",
        "UPDATE",
    ]
    .iter()
    .map(|p| row("events", p, false))
    .collect();
    let (granted, _) = summarize_acl(&grant, &rows);
    assert_eq!(
        normalize_read(ObjectType::Table, granted.unwrap(), &grant.privileges),
        set(&["ALL"])
    );
}

// ─── Resource surface ────────────────────────────────────────────────────────

#[test]
fn test_validate_reports_attribute() {
    let findings = GrantResource.validate(&json!({
        "role": "reader",
        "database": "app",
        "schema": null,
        "object_type": "table",
        "privileges": ["SELECT"]
    }));
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].attribute.as_deref(), Some("schema"));
}

#[test]
fn test_validate_skips_unknown_object_type() {
    assert!(GrantResource
        .validate(&json!({"role": "reader", "object_type": null}))
        .is_empty());
}

#[test]
fn test_import_is_not_supported() {
    let err = GrantResource.import_state("whatever").unwrap_err();
    assert!(err.to_string().contains("does not support import"));
}
