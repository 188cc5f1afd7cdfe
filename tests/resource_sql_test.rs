use std::collections::{BTreeMap, BTreeSet};

use pgprovider::client::version::ServerVersion;
use pgprovider::resources::cron_job::CronJobResource;
use pgprovider::resources::database::{self, Database, DatabaseResource};
use pgprovider::resources::default_privileges::{self, DefaultPrivileges};
use pgprovider::resources::extension::{self, Extension};
use pgprovider::resources::foreign_server::{self, ForeignServer};
use pgprovider::resources::grant_role::{self, GrantRole};
use pgprovider::resources::publication::{self, Publication, PublicationResource};
use pgprovider::resources::schema::{self, Schema, SchemaResource};
use pgprovider::resources::user_mapping::{self, UserMapping};
use pgprovider::resources::view::{self, View, ViewResource};
use pgprovider::resources::{decode_model, split_id, Resource};
use serde_json::json;

const PG96: ServerVersion = ServerVersion::new(90603);
const PG12: ServerVersion = ServerVersion::new(120000);
const PG15: ServerVersion = ServerVersion::new(150000);

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn options(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// ─── Database ────────────────────────────────────────────────────────────────

fn app_database() -> Database {
    decode_model(&json!({"name": "app", "owner": "app_owner", "template": "template0"})).unwrap()
}

#[test]
fn test_database_create_statement() {
    let db = Database {
        encoding: Some("UTF8".to_string()),
        connection_limit: Some(50),
        ..app_database()
    };
    assert_eq!(
        database::create_statement(&db, PG15).unwrap(),
        "CREATE DATABASE app WITH OWNER app_owner TEMPLATE template0 ENCODING 'UTF8' \
         CONNECTION LIMIT 50 ALLOW_CONNECTIONS true IS_TEMPLATE false"
    );
}

#[test]
fn test_database_update_renames_first() {
    let old = app_database();
    let new = Database {
        name: "app2".to_string(),
        owner: Some("other_owner".to_string()),
        allow_connections: false,
        ..app_database()
    };
    assert_eq!(
        database::update_statements(&old, &new, PG15).unwrap(),
        vec![
            "ALTER DATABASE app RENAME TO app2".to_string(),
            "ALTER DATABASE app2 OWNER TO other_owner".to_string(),
            "ALTER DATABASE app2 ALLOW_CONNECTIONS false".to_string(),
        ]
    );
}

#[test]
fn test_database_drop_statement() {
    assert_eq!(database::drop_statement("app", false), "DROP DATABASE app");
    assert_eq!(
        database::drop_statement("app", true),
        "DROP DATABASE app WITH (FORCE)"
    );
}

#[test]
fn test_database_validate_connection_limit() {
    let findings = DatabaseResource.validate(&json!({"name": "app", "connection_limit": -5}));
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].attribute.as_deref(), Some("connection_limit"));
}

// ─── Schema ──────────────────────────────────────────────────────────────────

#[test]
fn test_schema_create_uses_if_not_exists_when_supported() {
    let schema: Schema = decode_model(&json!({"name": "analytics", "owner": "app"})).unwrap();
    assert_eq!(
        schema::create_statement(&schema, PG15),
        "CREATE SCHEMA IF NOT EXISTS analytics AUTHORIZATION app"
    );
    assert_eq!(
        schema::create_statement(&schema, ServerVersion::new(90200)),
        "CREATE SCHEMA analytics AUTHORIZATION app"
    );
}

#[test]
fn test_schema_update_and_drop() {
    let old: Schema = decode_model(&json!({"name": "analytics", "owner": "app"})).unwrap();
    let new: Schema = decode_model(&json!({"name": "reporting", "owner": "etl"})).unwrap();
    assert_eq!(
        schema::update_statements(&old, &new),
        vec![
            "ALTER SCHEMA analytics RENAME TO reporting".to_string(),
            "ALTER SCHEMA reporting OWNER TO etl".to_string(),
        ]
    );
    assert_eq!(
        schema::drop_statement("reporting", true),
        "DROP SCHEMA reporting CASCADE"
    );
    assert_eq!(
        schema::drop_statement("reporting", false),
        "DROP SCHEMA reporting RESTRICT"
    );
}

#[test]
fn test_schema_import_id() {
    assert_eq!(
        SchemaResource.import_state("app.analytics").unwrap(),
        json!({"id": "app.analytics", "database": "app", "name": "analytics"})
    );
    assert!(SchemaResource.import_state("analytics").is_err());
}

// ─── Extension ───────────────────────────────────────────────────────────────

#[test]
fn test_extension_statements() {
    let ext = Extension {
        name: "pg_trgm".to_string(),
        schema: Some("extensions".to_string()),
        version: Some("1.6".to_string()),
        create_cascade: true,
        ..Default::default()
    };
    assert_eq!(
        extension::create_statement(&ext),
        "CREATE EXTENSION IF NOT EXISTS pg_trgm SCHEMA extensions VERSION '1.6' CASCADE"
    );

    let upgraded = Extension {
        version: None,
        ..ext.clone()
    };
    assert_eq!(
        extension::update_statements(&ext, &upgraded),
        vec!["ALTER EXTENSION pg_trgm UPDATE".to_string()]
    );
    assert_eq!(
        extension::drop_statement("pg_trgm", false),
        "DROP EXTENSION IF EXISTS pg_trgm"
    );
}

// ─── View ────────────────────────────────────────────────────────────────────

fn active_users() -> View {
    decode_model(&json!({
        "name": "active_users",
        "query": "SELECT * FROM users WHERE active;",
        "check_option": "LOCAL"
    }))
    .unwrap()
}

#[test]
fn test_view_create_spells_out_options() {
    assert_eq!(
        view::create_statement(&active_users(), PG15, false).unwrap(),
        "CREATE VIEW public.active_users WITH (security_barrier=false, security_invoker=false) \
         AS SELECT * FROM users WHERE active WITH LOCAL CHECK OPTION"
    );
}

#[test]
fn test_view_security_invoker_needs_pg15() {
    let plain = view::create_statement(&active_users(), PG12, true).unwrap();
    assert!(plain.starts_with("CREATE OR REPLACE VIEW"));
    assert!(!plain.contains("security_invoker"));

    let invoker = View {
        with_security_invoker: true,
        ..active_users()
    };
    assert!(view::create_statement(&invoker, PG12, false).is_err());
}

#[test]
fn test_view_check_option_must_match_catalog_spelling() {
    let lower = ViewResource.validate(&json!({"check_option": "local", "query": "SELECT 1"}));
    assert_eq!(lower.len(), 1);
    assert_eq!(lower[0].attribute.as_deref(), Some("check_option"));
    assert!(ViewResource
        .validate(&json!({"check_option": "CASCADED", "query": "SELECT 1"}))
        .is_empty());
}

#[test]
fn test_view_validate_and_import() {
    let findings = ViewResource.validate(&json!({"check_option": "sideways", "query": " "}));
    assert_eq!(findings.len(), 2);

    assert_eq!(
        ViewResource.import_state("app.public.active_users").unwrap()["schema"],
        json!("public")
    );
}

// ─── Publication ─────────────────────────────────────────────────────────────

#[test]
fn test_publication_create_for_tables() {
    let publication = Publication {
        name: "changes".to_string(),
        tables: set(&["public.users", "events"]),
        publish_param: vec!["insert".to_string(), "update".to_string()],
        ..Default::default()
    };
    assert_eq!(
        publication::create_statement(&publication, PG15).unwrap(),
        "CREATE PUBLICATION changes FOR TABLE public.events, public.users \
         WITH (publish = 'insert, update')"
    );
}

#[test]
fn test_publication_truncate_needs_pg11() {
    let publication = Publication {
        name: "changes".to_string(),
        all_tables: Some(true),
        publish_param: vec!["truncate".to_string()],
        ..Default::default()
    };
    assert!(publication::create_statement(&publication, ServerVersion::new(100000)).is_err());
    assert_eq!(
        publication::create_statement(&publication, PG12).unwrap(),
        "CREATE PUBLICATION changes FOR ALL TABLES WITH (publish = 'truncate')"
    );
}

#[test]
fn test_publication_update_adds_and_drops_tables() {
    let old = Publication {
        name: "changes".to_string(),
        tables: set(&["public.users", "public.orders"]),
        ..Default::default()
    };
    let new = Publication {
        tables: set(&["public.users", "public.events"]),
        ..old.clone()
    };
    assert_eq!(
        publication::update_statements(&old, &new, PG15).unwrap(),
        vec![
            "ALTER PUBLICATION changes ADD TABLE public.events".to_string(),
            "ALTER PUBLICATION changes DROP TABLE public.orders".to_string(),
        ]
    );
}

#[test]
fn test_publication_validate() {
    let findings = PublicationResource.validate(&json!({
        "all_tables": true,
        "tables": ["public.users"],
        "publish_param": ["insert", "upsert"]
    }));
    let attributes: Vec<_> = findings
        .iter()
        .filter_map(|f| f.attribute.as_deref())
        .collect();
    assert_eq!(attributes, vec!["tables", "publish_param"]);
}

// ─── Foreign server / user mapping ───────────────────────────────────────────

#[test]
fn test_foreign_server_create() {
    let server = ForeignServer {
        server_name: "remote".to_string(),
        fdw_name: "postgres_fdw".to_string(),
        options: options(&[("host", "db2"), ("dbname", "app")]),
        ..Default::default()
    };
    assert_eq!(
        foreign_server::create_statement(&server),
        "CREATE SERVER remote FOREIGN DATA WRAPPER postgres_fdw OPTIONS (dbname 'app', host 'db2')"
    );
}

#[test]
fn test_foreign_server_update() {
    let old = ForeignServer {
        server_name: "remote".to_string(),
        fdw_name: "postgres_fdw".to_string(),
        options: options(&[("host", "db2")]),
        ..Default::default()
    };
    let new = ForeignServer {
        server_version: Some("15".to_string()),
        options: options(&[("host", "db3")]),
        server_owner: Some("etl".to_string()),
        ..old.clone()
    };
    assert_eq!(
        foreign_server::update_statements(&old, &new),
        vec![
            "ALTER SERVER remote VERSION '15'".to_string(),
            "ALTER SERVER remote OPTIONS (SET host 'db3')".to_string(),
            "ALTER SERVER remote OWNER TO etl".to_string(),
        ]
    );
}

#[test]
fn test_user_mapping_statements() {
    let mapping = UserMapping {
        user_name: "public".to_string(),
        server_name: "remote".to_string(),
        options: options(&[("fetch_size", "100")]),
        ..Default::default()
    };
    assert_eq!(mapping.generate_id(), "public.remote");
    assert_eq!(
        user_mapping::create_statement(&mapping),
        "CREATE USER MAPPING FOR PUBLIC SERVER remote OPTIONS (fetch_size '100')"
    );
    assert!(user_mapping::update_statement(&mapping, &mapping).is_none());

    let changed = UserMapping {
        options: BTreeMap::new(),
        ..mapping.clone()
    };
    assert_eq!(
        user_mapping::update_statement(&mapping, &changed).unwrap(),
        "ALTER USER MAPPING FOR PUBLIC SERVER remote OPTIONS (DROP fetch_size)"
    );
}

// ─── Role membership / default privileges ────────────────────────────────────

#[test]
fn test_grant_role_revokes_before_granting() {
    let grant = GrantRole {
        role: "app".to_string(),
        grant_role: "reader".to_string(),
        with_admin_option: true,
        ..Default::default()
    };
    assert_eq!(grant.generate_id(), "app_reader_true");
    assert_eq!(
        grant_role::create_statements(&grant),
        vec![
            "REVOKE reader FROM app".to_string(),
            "GRANT reader TO app WITH ADMIN OPTION".to_string(),
        ]
    );
}

fn table_defaults() -> DefaultPrivileges {
    DefaultPrivileges {
        role: "reader".to_string(),
        database: "app".to_string(),
        owner: "app_owner".to_string(),
        schema: Some("analytics".to_string()),
        object_type: "table".to_string(),
        privileges: set(&["SELECT"]),
        ..Default::default()
    }
}

#[test]
fn test_default_privileges_statements() {
    let defaults = table_defaults();
    assert_eq!(defaults.generate_id(), "reader_app_analytics_app_owner_table");
    assert_eq!(
        default_privileges::grant_statement(&defaults, &set(&["SELECT"]), PG15).unwrap(),
        "ALTER DEFAULT PRIVILEGES FOR ROLE app_owner IN SCHEMA analytics \
         GRANT SELECT ON TABLES TO reader"
    );
    assert_eq!(
        default_privileges::revoke_statement(&defaults, PG15).unwrap(),
        "ALTER DEFAULT PRIVILEGES FOR ROLE app_owner IN SCHEMA analytics \
         REVOKE ALL ON TABLES FROM reader"
    );
}

#[test]
fn test_default_privileges_on_schemas() {
    let defaults = DefaultPrivileges {
        schema: None,
        object_type: "schema".to_string(),
        privileges: set(&["USAGE"]),
        ..table_defaults()
    };
    assert!(defaults.check().is_ok());
    assert!(default_privileges::revoke_statement(&defaults, PG96).is_err());
    assert_eq!(
        default_privileges::revoke_statement(&defaults, PG15).unwrap(),
        "ALTER DEFAULT PRIVILEGES FOR ROLE app_owner REVOKE ALL ON SCHEMAS FROM reader"
    );

    let with_schema = DefaultPrivileges {
        schema: Some("analytics".to_string()),
        ..defaults
    };
    assert!(with_schema.check().is_err());
}

#[test]
fn test_default_privileges_reject_unsupported_types() {
    let defaults = DefaultPrivileges {
        object_type: "database".to_string(),
        ..table_defaults()
    };
    assert!(defaults.kind().is_err());
}

// ─── Import IDs ──────────────────────────────────────────────────────────────

#[test]
fn test_split_id() {
    assert_eq!(split_id("a.b.c", '.', 3, "x").unwrap(), vec!["a", "b", "c"]);
    // The last piece keeps any further separators.
    assert_eq!(split_id("a.b.c", '.', 2, "x").unwrap(), vec!["a", "b.c"]);
    assert!(split_id("a.", '.', 2, "x").is_err());
}

#[test]
fn test_cron_job_import_needs_numeric_id() {
    assert_eq!(
        CronJobResource.import_state("17").unwrap(),
        json!({"id": "17", "job_id": 17})
    );
    let err = CronJobResource.import_state("nightly").unwrap_err();
    assert!(err.to_string().contains("numeric pg_cron job id"));
}
