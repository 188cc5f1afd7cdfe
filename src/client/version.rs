//! PostgreSQL server versions and the features they gate.
//!
//! Version numbers follow `server_version_num`: `MAJOR * 10000 + PATCH` from 10 on
//! (15.4 is 150004), `MAJOR * 10000 + MINOR * 100 + PATCH` before that (9.6.3 is 90603).

use std::fmt;

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::error::ProviderError;

pub const POSTGRES_8_1: i32 = 80100;
pub const POSTGRES_8_4: i32 = 80400;
pub const POSTGRES_9_0: i32 = 90000;
pub const POSTGRES_9_1: i32 = 90100;
pub const POSTGRES_9_3: i32 = 90300;
pub const POSTGRES_9_4: i32 = 90400;
pub const POSTGRES_9_5: i32 = 90500;
pub const POSTGRES_10: i32 = 100000;
pub const POSTGRES_11: i32 = 110000;
pub const POSTGRES_13: i32 = 130000;
pub const POSTGRES_15: i32 = 150000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion(i32);

impl ServerVersion {
    pub const fn new(version_num: i32) -> Self {
        Self(version_num)
    }

    pub fn number(&self) -> i32 {
        self.0
    }

    /// Parse a dotted version like `9.6.3`, `15.4` or `16`.
    pub fn parse(text: &str) -> Result<Self> {
        let re = Regex::new(r"^(\d+)(?:\.(\d+))?(?:\.(\d+))?")?;
        let caps = re
            .captures(text.trim())
            .with_context(|| format!("Invalid PostgreSQL version {:?}", text))?;
        let part = |i: usize| -> Result<i32> {
            caps.get(i)
                .map(|m| m.as_str().parse::<i32>())
                .transpose()
                .with_context(|| format!("Invalid PostgreSQL version {:?}", text))
                .map(|v| v.unwrap_or(0))
        };
        let (major, minor, patch) = (part(1)?, part(2)?, part(3)?);
        if major == 0 {
            bail!("Invalid PostgreSQL version {:?}", text);
        }
        // From 10 on the second component is the patch level.
        let rest = if major >= 10 {
            Some(minor)
        } else {
            minor.checked_mul(100).and_then(|m| m.checked_add(patch))
        };
        major
            .checked_mul(10000)
            .zip(rest)
            .and_then(|(major, rest)| major.checked_add(rest))
            .map(Self)
            .with_context(|| format!("Invalid PostgreSQL version {:?}", text))
    }

    pub fn supports(&self, feature: Feature) -> bool {
        self.0 >= feature.min_version()
    }

    /// Fail with a typed error when `feature` is unavailable.
    pub fn require(&self, feature: Feature) -> Result<(), ProviderError> {
        if self.supports(feature) {
            Ok(())
        } else {
            Err(ProviderError::UnsupportedFeature {
                feature,
                version: *self,
            })
        }
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let major = self.0 / 10000;
        if major >= 10 {
            write!(f, "{}.{}", major, self.0 % 10000)
        } else {
            write!(f, "{}.{}.{}", major, (self.0 / 100) % 100, self.0 % 100)
        }
    }
}

/// Features whose availability depends on the server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    CreateRoleWith,
    DatabaseOwnerRole,
    Privileges,
    Extension,
    Replication,
    SchemaCreateIfNotExists,
    ReplicationSlots,
    BypassRowLevelSecurity,
    DatabaseAllowConnections,
    DatabaseIsTemplate,
    Publication,
    PrivilegesOnSchemas,
    Procedure,
    PublicationTruncate,
    PublishViaPartitionRoot,
    ForceDropDatabase,
    SecurityInvokerViews,
}

impl Feature {
    pub fn min_version(&self) -> i32 {
        match self {
            Feature::CreateRoleWith => POSTGRES_8_1,
            Feature::DatabaseOwnerRole => POSTGRES_8_4,
            Feature::Privileges => POSTGRES_9_0,
            Feature::Extension | Feature::Replication => POSTGRES_9_1,
            Feature::SchemaCreateIfNotExists => POSTGRES_9_3,
            Feature::ReplicationSlots => POSTGRES_9_4,
            Feature::BypassRowLevelSecurity
            | Feature::DatabaseAllowConnections
            | Feature::DatabaseIsTemplate => POSTGRES_9_5,
            Feature::Publication | Feature::PrivilegesOnSchemas => POSTGRES_10,
            Feature::Procedure | Feature::PublicationTruncate => POSTGRES_11,
            Feature::PublishViaPartitionRoot | Feature::ForceDropDatabase => POSTGRES_13,
            Feature::SecurityInvokerViews => POSTGRES_15,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Feature::CreateRoleWith => "CREATE ROLE ... WITH",
            Feature::DatabaseOwnerRole => "database owner roles",
            Feature::Privileges => "GRANT ... ON ALL ... IN SCHEMA",
            Feature::Extension => "extensions",
            Feature::Replication => "replication roles",
            Feature::SchemaCreateIfNotExists => "CREATE SCHEMA IF NOT EXISTS",
            Feature::ReplicationSlots => "replication slots",
            Feature::BypassRowLevelSecurity => "BYPASSRLS",
            Feature::DatabaseAllowConnections => "ALLOW_CONNECTIONS",
            Feature::DatabaseIsTemplate => "IS_TEMPLATE",
            Feature::Publication => "publications",
            Feature::PrivilegesOnSchemas => "default privileges on schemas",
            Feature::Procedure => "procedures",
            Feature::PublicationTruncate => "publishing truncate",
            Feature::PublishViaPartitionRoot => "publish_via_partition_root",
            Feature::ForceDropDatabase => "DROP DATABASE ... WITH (FORCE)",
            Feature::SecurityInvokerViews => "security_invoker views",
        };
        f.write_str(name)
    }
}
