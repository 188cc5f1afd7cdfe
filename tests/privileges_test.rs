use std::collections::BTreeSet;

use pgprovider::resources::privileges::{
    diff, expand_all, intersect_all, normalize_read, privilege_list, validate_privileges,
    ObjectType,
};

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_object_type_parses_and_displays() {
    let kind: ObjectType = "foreign_data_wrapper".parse().unwrap();
    assert_eq!(kind, ObjectType::ForeignDataWrapper);
    assert_eq!(kind.to_string(), "foreign_data_wrapper");
    assert!("view".parse::<ObjectType>().is_err());
}

#[test]
fn test_validate_uppercases_privileges() {
    let normalized = validate_privileges(ObjectType::Table, &set(&["select", " insert "])).unwrap();
    assert_eq!(normalized, set(&["INSERT", "SELECT"]));
}

#[test]
fn test_validate_rejects_privilege_foreign_to_type() {
    let err = validate_privileges(ObjectType::Sequence, &set(&["INSERT"])).unwrap_err();
    assert!(err.to_string().contains("INSERT is not a valid privilege for sequence"));
}

#[test]
fn test_all_is_not_allowed_for_columns() {
    assert!(validate_privileges(ObjectType::Column, &set(&["ALL"])).is_err());
    assert!(validate_privileges(ObjectType::Table, &set(&["ALL"])).is_ok());
}

#[test]
fn test_all_cannot_be_mixed() {
    assert!(validate_privileges(ObjectType::Schema, &set(&["ALL", "USAGE"])).is_err());
}

#[test]
fn test_expand_all() {
    assert_eq!(
        expand_all(ObjectType::Schema, &set(&["ALL"])),
        set(&["CREATE", "USAGE"])
    );
    assert_eq!(expand_all(ObjectType::Schema, &set(&["USAGE"])), set(&["USAGE"]));
}

#[test]
fn test_read_keeps_all_when_fully_granted() {
    let granted = set(&["CONNECT", "CREATE", "TEMPORARY"]);
    assert_eq!(
        normalize_read(ObjectType::Database, granted.clone(), &set(&["ALL"])),
        set(&["ALL"])
    );
    // State lists privileges one by one: report them the same way.
    assert_eq!(
        normalize_read(
            ObjectType::Database,
            granted.clone(),
            &set(&["CONNECT", "CREATE", "TEMPORARY"])
        ),
        granted
    );
    // Partial grant with ALL in state shows the drift.
    assert_eq!(
        normalize_read(ObjectType::Database, set(&["CONNECT"]), &set(&["ALL"])),
        set(&["CONNECT"])
    );
}

#[test]
fn test_read_ignores_maintain_on_pg17_tables() {
    let granted = set(&[
        "DELETE",
        "INSERT",
        "MAINTAIN",
        "REFERENCES",
        "SELECT",
        "TRIGGER",
        "TRUNCATE",
        "UPDATE",
    ]);
    assert_eq!(
        normalize_read(ObjectType::Table, granted, &set(&["ALL"])),
        set(&["ALL"])
    );
    assert_eq!(
        normalize_read(ObjectType::Table, set(&["MAINTAIN", "SELECT"]), &set(&["SELECT"])),
        set(&["SELECT"])
    );
}

#[test]
fn test_diff_expands_all_on_both_sides() {
    let change = diff(ObjectType::Sequence, &set(&["ALL"]), &set(&["USAGE"]));
    assert_eq!(change.grant, set(&[]));
    assert_eq!(change.revoke, set(&["SELECT", "UPDATE"]));

    let change = diff(ObjectType::Sequence, &set(&["USAGE"]), &set(&["ALL"]));
    assert_eq!(change.grant, set(&["SELECT", "UPDATE"]));
    assert!(change.revoke.is_empty());

    assert!(diff(ObjectType::Table, &set(&["SELECT"]), &set(&["SELECT"])).is_empty());
}

#[test]
fn test_intersect_all() {
    assert_eq!(
        intersect_all(&[set(&["SELECT", "INSERT"]), set(&["SELECT"]), set(&["SELECT", "UPDATE"])]),
        set(&["SELECT"])
    );
    assert!(intersect_all(&[]).is_empty());
}

#[test]
fn test_privilege_list() {
    assert_eq!(privilege_list(&set(&["ALL"])), "ALL PRIVILEGES");
    assert_eq!(privilege_list(&set(&["UPDATE", "SELECT"])), "SELECT, UPDATE");
}

#[test]
fn test_default_acl_codes() {
    assert_eq!(ObjectType::Table.default_acl_code(), Some("r"));
    assert_eq!(ObjectType::Sequence.default_acl_code(), Some("S"));
    assert_eq!(ObjectType::Type.default_acl_code(), Some("T"));
    assert_eq!(ObjectType::Database.default_acl_code(), None);
}
