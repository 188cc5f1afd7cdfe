//! Privilege vocabulary shared by `postgresql_grant` and
//! `postgresql_default_privileges`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::ProviderError;

/// Kinds of objects privileges can be granted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Database,
    Schema,
    Table,
    Sequence,
    Function,
    Procedure,
    Routine,
    Type,
    ForeignDataWrapper,
    ForeignServer,
    Column,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Database => "database",
            ObjectType::Schema => "schema",
            ObjectType::Table => "table",
            ObjectType::Sequence => "sequence",
            ObjectType::Function => "function",
            ObjectType::Procedure => "procedure",
            ObjectType::Routine => "routine",
            ObjectType::Type => "type",
            ObjectType::ForeignDataWrapper => "foreign_data_wrapper",
            ObjectType::ForeignServer => "foreign_server",
            ObjectType::Column => "column",
        }
    }

    /// Privileges that may appear for this object type, `ALL` excluded.
    pub fn concrete_privileges(&self) -> &'static [&'static str] {
        match self {
            ObjectType::Database => &["CONNECT", "CREATE", "TEMPORARY"],
            ObjectType::Schema => &["CREATE", "USAGE"],
            ObjectType::Table => &[
                "DELETE",
                "INSERT",
                "REFERENCES",
                "SELECT",
                "TRIGGER",
                "TRUNCATE",
                "UPDATE",
            ],
            ObjectType::Sequence => &["SELECT", "UPDATE", "USAGE"],
            ObjectType::Function | ObjectType::Procedure | ObjectType::Routine => &["EXECUTE"],
            ObjectType::Type | ObjectType::ForeignDataWrapper | ObjectType::ForeignServer => {
                &["USAGE"]
            }
            ObjectType::Column => &["INSERT", "REFERENCES", "SELECT", "UPDATE"],
        }
    }

    pub fn allows_all(&self) -> bool {
        !matches!(self, ObjectType::Column)
    }

    /// Whether `objects` may name individual objects for this type.
    pub fn takes_objects(&self) -> bool {
        !matches!(self, ObjectType::Database | ObjectType::Schema | ObjectType::Type)
    }

    /// Whether the grant targets objects inside a schema.
    pub fn needs_schema(&self) -> bool {
        matches!(
            self,
            ObjectType::Table
                | ObjectType::Sequence
                | ObjectType::Function
                | ObjectType::Procedure
                | ObjectType::Routine
                | ObjectType::Column
        )
    }

    /// Plural keyword used by `ALTER DEFAULT PRIVILEGES ... ON <kind>` and
    /// `GRANT ... ON ALL <kind> IN SCHEMA`.
    pub fn plural_keyword(&self) -> Option<&'static str> {
        match self {
            ObjectType::Table => Some("TABLES"),
            ObjectType::Sequence => Some("SEQUENCES"),
            ObjectType::Function => Some("FUNCTIONS"),
            ObjectType::Procedure => Some("PROCEDURES"),
            ObjectType::Routine => Some("ROUTINES"),
            ObjectType::Type => Some("TYPES"),
            ObjectType::Schema => Some("SCHEMAS"),
            _ => None,
        }
    }

    /// `pg_default_acl.defaclobjtype` code.
    pub fn default_acl_code(&self) -> Option<&'static str> {
        match self {
            ObjectType::Table => Some("r"),
            ObjectType::Sequence => Some("S"),
            ObjectType::Function => Some("f"),
            ObjectType::Type => Some("T"),
            ObjectType::Schema => Some("n"),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "database" => ObjectType::Database,
            "schema" => ObjectType::Schema,
            "table" => ObjectType::Table,
            "sequence" => ObjectType::Sequence,
            "function" => ObjectType::Function,
            "procedure" => ObjectType::Procedure,
            "routine" => ObjectType::Routine,
            "type" => ObjectType::Type,
            "foreign_data_wrapper" => ObjectType::ForeignDataWrapper,
            "foreign_server" => ObjectType::ForeignServer,
            "column" => ObjectType::Column,
            other => {
                return Err(ProviderError::invalid(
                    "object_type",
                    format!("unsupported object type {:?}", other),
                ))
            }
        })
    }
}

/// Uppercase and check every privilege against the object type.
pub fn validate_privileges(
    object_type: ObjectType,
    privileges: &BTreeSet<String>,
) -> Result<BTreeSet<String>, ProviderError> {
    let mut normalized = BTreeSet::new();
    for privilege in privileges {
        let upper = privilege.trim().to_ascii_uppercase();
        let allowed = if upper == "ALL" {
            object_type.allows_all()
        } else {
            object_type.concrete_privileges().contains(&upper.as_str())
        };
        if !allowed {
            return Err(ProviderError::invalid(
                "privileges",
                format!("{} is not a valid privilege for {}", upper, object_type),
            ));
        }
        normalized.insert(upper);
    }
    if normalized.contains("ALL") && normalized.len() > 1 {
        return Err(ProviderError::invalid(
            "privileges",
            "ALL cannot be combined with other privileges",
        ));
    }
    Ok(normalized)
}

/// Replace `ALL` by the privileges it stands for.
pub fn expand_all(object_type: ObjectType, privileges: &BTreeSet<String>) -> BTreeSet<String> {
    if privileges.contains("ALL") {
        object_type
            .concrete_privileges()
            .iter()
            .map(|p| p.to_string())
            .collect()
    } else {
        privileges.clone()
    }
}

/// Express privileges read from the catalog the way the state does: when the
/// state says `ALL` and every concrete privilege is granted, keep `ALL`.
/// Privileges this provider cannot manage (MAINTAIN on PostgreSQL 17 tables)
/// are dropped.
pub fn normalize_read(
    object_type: ObjectType,
    granted: BTreeSet<String>,
    in_state: &BTreeSet<String>,
) -> BTreeSet<String> {
    let known = object_type.concrete_privileges();
    let granted: BTreeSet<String> = granted
        .into_iter()
        .filter(|p| known.contains(&p.as_str()))
        .collect();
    let all = expand_all(object_type, &BTreeSet::from(["ALL".to_string()]));
    if in_state.contains("ALL") && object_type.allows_all() && all.is_subset(&granted) {
        BTreeSet::from(["ALL".to_string()])
    } else {
        granted
    }
}

/// Privileges to grant and revoke to move from `prior` to `planned`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivilegeDiff {
    pub grant: BTreeSet<String>,
    pub revoke: BTreeSet<String>,
}

impl PrivilegeDiff {
    pub fn is_empty(&self) -> bool {
        self.grant.is_empty() && self.revoke.is_empty()
    }
}

pub fn diff(
    object_type: ObjectType,
    prior: &BTreeSet<String>,
    planned: &BTreeSet<String>,
) -> PrivilegeDiff {
    let prior = expand_all(object_type, prior);
    let planned = expand_all(object_type, planned);
    PrivilegeDiff {
        grant: planned.difference(&prior).cloned().collect(),
        revoke: prior.difference(&planned).cloned().collect(),
    }
}

/// Privileges held on every one of `per_object`; empty input yields empty.
pub fn intersect_all(per_object: &[BTreeSet<String>]) -> BTreeSet<String> {
    let mut iter = per_object.iter();
    let Some(first) = iter.next() else {
        return BTreeSet::new();
    };
    iter.fold(first.clone(), |acc, set| {
        acc.intersection(set).cloned().collect()
    })
}

pub fn privilege_list(privileges: &BTreeSet<String>) -> String {
    if privileges.contains("ALL") {
        return "ALL PRIVILEGES".to_string();
    }
    privileges.iter().cloned().collect::<Vec<_>>().join(", ")
}
