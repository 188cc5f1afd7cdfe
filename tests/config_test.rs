use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use pgprovider::config::{Env, ProviderBlock, DEFAULT_MAX_CONNECTIONS};
use serde_json::json;
use tempfile::NamedTempFile;

/// Environment backed by a map instead of the process environment.
#[derive(Default)]
struct FakeEnv(HashMap<&'static str, &'static str>);

impl Env for FakeEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.0.get(key).map(|v| v.to_string())
    }
}

fn env(pairs: &[(&'static str, &'static str)]) -> FakeEnv {
    FakeEnv(pairs.iter().copied().collect())
}

fn attributes(findings: &[pgprovider::plugin::diagnostics::Finding]) -> Vec<&str> {
    findings
        .iter()
        .filter_map(|f| f.attribute.as_deref())
        .collect()
}

// ─── Resolution ──────────────────────────────────────────────────────────────

#[test]
fn test_defaults_when_nothing_is_set() {
    let config = ProviderBlock::default().resolve(&FakeEnv::default());

    assert_eq!(config.host, "localhost");
    assert_eq!(config.port, 5432);
    assert_eq!(config.database, "postgres");
    assert_eq!(config.username, "postgres");
    assert_eq!(config.password, None);
    assert!(config.superuser);
    assert_eq!(config.sslmode, "prefer");
    assert_eq!(config.connect_timeout, Duration::from_secs(180));
    assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    assert!(config.jump_host.is_none());
}

#[test]
fn test_environment_fills_unset_attributes() {
    let env = env(&[
        ("PGHOST", "db.internal"),
        ("PGPORT", "6432"),
        ("PGDATABASE", "app"),
        ("PGUSER", "admin"),
        ("PGPASSWORD", "s3cret"),
        ("PGSSLMODE", "require"),
        ("PGCONNECT_TIMEOUT", "15"),
        ("PGSSLROOTCERT", "/etc/ssl/root.crt"),
    ]);
    let config = ProviderBlock::default().resolve(&env);

    assert_eq!(config.host, "db.internal");
    assert_eq!(config.port, 6432);
    assert_eq!(config.database, "app");
    assert_eq!(config.username, "admin");
    assert_eq!(config.password.as_deref(), Some("s3cret"));
    assert_eq!(config.sslmode, "require");
    assert_eq!(config.connect_timeout, Duration::from_secs(15));
    assert_eq!(config.sslrootcert, Some(PathBuf::from("/etc/ssl/root.crt")));
}

#[test]
fn test_provider_block_wins_over_environment() {
    let block = ProviderBlock::from_value(&json!({
        "host": "primary",
        "port": 5433,
        "username": "terraform",
        "superuser": false,
        "max_connections": 4,
        "jump_host": [{"host": "bastion", "user": "ops"}]
    }))
    .unwrap();
    let config = block.resolve(&env(&[("PGHOST", "ignored"), ("PGUSER", "ignored")]));

    assert_eq!(config.host, "primary");
    assert_eq!(config.port, 5433);
    assert_eq!(config.username, "terraform");
    assert!(!config.superuser);
    assert_eq!(config.max_connections, 4);

    let jump = config.jump_host.unwrap();
    assert_eq!(jump.host, "bastion");
    assert_eq!(jump.port, 22);
    assert_eq!(jump.user.as_deref(), Some("ops"));
}

#[test]
fn test_null_attributes_are_treated_as_unset() {
    let block = ProviderBlock::from_value(&json!({"host": null, "port": null, "jump_host": null})).unwrap();
    let config = block.resolve(&env(&[("PGHOST", "from-env")]));
    assert_eq!(config.host, "from-env");
    assert_eq!(config.port, 5432);
}

// ─── Validation ──────────────────────────────────────────────────────────────

#[test]
fn test_valid_block_has_no_findings() {
    let block = ProviderBlock::from_value(&json!({
        "host": "db",
        "port": 5432,
        "sslmode": "verify-full",
        "max_connections": 10,
        "expected_version": "15.4"
    }))
    .unwrap();
    assert!(block.validate().is_empty());
}

#[test]
fn test_invalid_values_are_reported_per_attribute() {
    let block = ProviderBlock::from_value(&json!({
        "port": 70000,
        "sslmode": "sometimes",
        "max_connections": 0,
        "connect_timeout": -1,
        "expected_version": "latest"
    }))
    .unwrap();
    let findings = block.validate();

    assert_eq!(
        attributes(&findings),
        vec!["port", "sslmode", "max_connections", "connect_timeout", "expected_version"]
    );
    assert!(findings.iter().all(|f| f.is_error()));
}

#[test]
fn test_jump_host_key_file_must_exist() {
    let key = NamedTempFile::new().unwrap();
    let present = ProviderBlock::from_value(&json!({
        "jump_host": [{"host": "bastion", "private_key_file": key.path().to_str().unwrap()}]
    }))
    .unwrap();
    assert!(present.validate().is_empty());

    let missing = ProviderBlock::from_value(&json!({
        "jump_host": [{"host": "bastion", "private_key_file": "/nonexistent/id_ed25519"}]
    }))
    .unwrap();
    assert_eq!(attributes(&missing.validate()), vec!["jump_host"]);
}
