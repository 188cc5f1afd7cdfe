use pgprovider::plugin::codec::{self, get_attr, is_unknown};
use pgprovider::plugin::diagnostics::has_errors;
use pgprovider::plugin::service::ProviderService;
use pgprovider::plugin::tfplugin6::provider_server::Provider;
use pgprovider::plugin::tfplugin6::*;
use pgprovider::resources::schema::SchemaResource;
use pgprovider::resources::Resource;
use serde_json::{json, Value};
use tonic::Request;

fn dv(value: Value) -> Option<DynamicValue> {
    Some(codec::encode(&value).unwrap())
}

fn schema_config() -> Value {
    SchemaResource.schema().conform(&json!({"name": "analytics"}))
}

// ─── Discovery ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_metadata_lists_resources_sorted() {
    let service = ProviderService::new();
    let response = service
        .get_metadata(Request::new(get_metadata::Request {}))
        .await
        .unwrap()
        .into_inner();

    let names: Vec<_> = response.resources.iter().map(|r| r.type_name.clone()).collect();
    assert_eq!(names.len(), 14);
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
    assert!(names.contains(&"postgresql_role".to_string()));
    assert!(response.data_sources.is_empty());
    assert!(response.server_capabilities.unwrap().plan_destroy);
}

#[tokio::test]
async fn test_provider_schema_covers_every_resource() {
    let service = ProviderService::new();
    let response = service
        .get_provider_schema(Request::new(get_provider_schema::Request {}))
        .await
        .unwrap()
        .into_inner();

    assert!(response.provider.is_some());
    assert_eq!(response.resource_schemas.len(), 14);
    for name in service.resource_types() {
        assert!(response.resource_schemas.contains_key(name), "missing {}", name);
    }
    assert!(response.diagnostics.is_empty());
}

// ─── Validation ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_bad_port_is_attributed() {
    let service = ProviderService::new();
    let response = service
        .validate_provider_config(Request::new(validate_provider_config::Request {
            config: dv(json!({"host": "db", "port": 70000})),
        }))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.diagnostics.len(), 1);
    let path = response.diagnostics[0].attribute.as_ref().unwrap();
    assert_eq!(codec::attribute_path_to_string(path), "port");
}

#[tokio::test]
async fn test_valid_provider_config_has_no_diagnostics() {
    let service = ProviderService::new();
    let response = service
        .validate_provider_config(Request::new(validate_provider_config::Request {
            config: dv(json!({"host": "db", "port": 5432, "sslmode": "require"})),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(response.diagnostics.is_empty());
}

#[tokio::test]
async fn test_unknown_resource_type_is_reported() {
    let service = ProviderService::new();
    let response = service
        .validate_resource_config(Request::new(validate_resource_config::Request {
            type_name: "postgresql_table".to_string(),
            config: dv(json!({})),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(has_errors(&response.diagnostics));
    assert!(response.diagnostics[0].summary.contains("postgresql_table"));
}

#[tokio::test]
async fn test_data_sources_are_rejected() {
    let service = ProviderService::new();
    let response = service
        .read_data_source(Request::new(read_data_source::Request {
            type_name: "postgresql_tables".to_string(),
            config: None,
            provider_meta: None,
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(response.state.is_none());
    assert!(response.diagnostics[0].summary.contains("unknown data source type"));
}

// ─── Planning ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_plan_create_marks_id_unknown() {
    let service = ProviderService::new();
    let response = service
        .plan_resource_change(Request::new(plan_resource_change::Request {
            type_name: "postgresql_schema".to_string(),
            prior_state: dv(Value::Null),
            proposed_new_state: dv(schema_config()),
            config: dv(schema_config()),
            prior_private: vec![],
            provider_meta: None,
        }))
        .await
        .unwrap()
        .into_inner();

    assert!(response.diagnostics.is_empty());
    assert!(response.legacy_type_system);
    let planned = codec::decode_raw(response.planned_state.as_ref()).unwrap();
    assert!(is_unknown(get_attr(&planned, "id").unwrap()));
    assert_eq!(get_attr(&planned, "name").unwrap().as_str(), Some("analytics"));
}

#[tokio::test]
async fn test_plan_rename_of_force_new_attribute_requires_replace() {
    let service = ProviderService::new();
    let prior = json!({
        "id": "app.public.active_users",
        "name": "active_users",
        "database": "app",
        "schema": "public",
        "query": "SELECT 1",
        "check_option": null,
        "with_security_barrier": false,
        "with_security_invoker": false,
        "drop_cascade": false
    });
    let mut proposed = prior.clone();
    proposed["schema"] = json!("reporting");

    let response = service
        .plan_resource_change(Request::new(plan_resource_change::Request {
            type_name: "postgresql_view".to_string(),
            prior_state: dv(prior),
            proposed_new_state: dv(proposed.clone()),
            config: dv(proposed),
            prior_private: b"private".to_vec(),
            provider_meta: None,
        }))
        .await
        .unwrap()
        .into_inner();

    let replaced: Vec<_> = response
        .requires_replace
        .iter()
        .map(codec::attribute_path_to_string)
        .collect();
    assert_eq!(replaced, vec!["schema"]);
    assert_eq!(response.planned_private, b"private".to_vec());
}

// ─── Unconfigured provider ───────────────────────────────────────────────────

#[tokio::test]
async fn test_apply_before_configure_fails_cleanly() {
    let service = ProviderService::new();
    let response = service
        .apply_resource_change(Request::new(apply_resource_change::Request {
            type_name: "postgresql_schema".to_string(),
            prior_state: dv(Value::Null),
            planned_state: dv(schema_config()),
            config: dv(schema_config()),
            planned_private: vec![],
            provider_meta: None,
        }))
        .await
        .unwrap()
        .into_inner();

    assert!(response.diagnostics[0].summary.contains("provider is not configured"));
    // A failed create leaves no state behind.
    let state = codec::decode(response.new_state.as_ref()).unwrap();
    assert!(state.is_null());
}

#[tokio::test]
async fn test_read_failure_keeps_current_state() {
    let service = ProviderService::new();
    let current = dv(json!({"id": "app.analytics", "name": "analytics", "database": "app"}));
    let response = service
        .read_resource(Request::new(read_resource::Request {
            type_name: "postgresql_schema".to_string(),
            current_state: current.clone(),
            private: vec![],
            provider_meta: None,
        }))
        .await
        .unwrap()
        .into_inner();

    assert!(has_errors(&response.diagnostics));
    assert_eq!(response.new_state, current);
}

#[tokio::test]
async fn test_read_of_null_state_needs_no_connection() {
    let service = ProviderService::new();
    let response = service
        .read_resource(Request::new(read_resource::Request {
            type_name: "postgresql_schema".to_string(),
            current_state: dv(Value::Null),
            private: vec![],
            provider_meta: None,
        }))
        .await
        .unwrap()
        .into_inner();

    assert!(response.diagnostics.is_empty());
    assert!(codec::decode(response.new_state.as_ref()).unwrap().is_null());
}

// ─── Import / upgrade / stop ─────────────────────────────────────────────────

#[tokio::test]
async fn test_import_of_grant_is_refused() {
    let service = ProviderService::new();
    let response = service
        .import_resource_state(Request::new(import_resource_state::Request {
            type_name: "postgresql_grant".to_string(),
            id: "reader_app_database".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();

    assert!(response.imported_resources.is_empty());
    assert!(response.diagnostics[0].summary.contains("does not support import"));
}

#[tokio::test]
async fn test_upgrade_reshapes_stored_state() {
    let service = ProviderService::new();
    let raw = serde_json::to_vec(&json!({"id": "app.analytics", "name": "analytics", "legacy": 1}))
        .unwrap();
    let response = service
        .upgrade_resource_state(Request::new(upgrade_resource_state::Request {
            type_name: "postgresql_schema".to_string(),
            version: 0,
            raw_state: Some(RawState {
                json: raw,
                flatmap: Default::default(),
            }),
        }))
        .await
        .unwrap()
        .into_inner();

    assert!(response.diagnostics.is_empty());
    let upgraded = codec::decode(response.upgraded_state.as_ref()).unwrap();
    assert_eq!(upgraded["name"], json!("analytics"));
    assert!(upgraded.get("legacy").is_none());
    assert!(upgraded.as_object().unwrap().contains_key("owner"));
}

#[tokio::test]
async fn test_stop_reports_no_error() {
    let service = ProviderService::new();
    let response = service
        .stop_provider(Request::new(stop_provider::Request {}))
        .await
        .unwrap()
        .into_inner();
    assert!(response.error.is_empty());
}
