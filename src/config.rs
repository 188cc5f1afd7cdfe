use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::plugin::diagnostics::Finding;
use crate::schema::{AttrType, Attribute, Block, NestedBlock, Nesting};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_DATABASE: &str = "postgres";
pub const DEFAULT_USERNAME: &str = "postgres";
pub const DEFAULT_SSLMODE: &str = "prefer";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 180;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 20;
pub const DEFAULT_APPLICATION_NAME: &str = "Terraform provider";

const SSL_MODES: &[&str] = &[
    "disable",
    "allow",
    "prefer",
    "require",
    "verify-ca",
    "verify-full",
];

// ─── Raw Provider Block ─────────────────────────────────────────────────────

/// The provider block as the host sends it. Everything is optional; unset
/// values fall back to `PG*` environment variables and then to defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderBlock {
    pub host: Option<String>,
    pub port: Option<i64>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database_username: Option<String>,
    pub superuser: Option<bool>,
    pub sslmode: Option<String>,
    pub sslrootcert: Option<String>,
    pub connect_timeout: Option<i64>,
    pub max_connections: Option<i64>,
    pub expected_version: Option<String>,
    pub application_name: Option<String>,
    pub jump_host: Vec<JumpHostBlock>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JumpHostBlock {
    pub host: Option<String>,
    pub port: Option<i64>,
    pub user: Option<String>,
    pub private_key_file: Option<String>,
}

// ─── Resolved Config ────────────────────────────────────────────────────────

/// Connection settings after defaults and environment are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: Option<String>,
    pub database_username: Option<String>,
    pub superuser: bool,
    pub sslmode: String,
    pub sslrootcert: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub max_connections: u32,
    pub expected_version: Option<String>,
    pub application_name: String,
    pub jump_host: Option<JumpHost>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpHost {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub private_key_file: Option<PathBuf>,
}

/// Source of environment variables, so resolution can be tested without
/// touching the process environment.
pub trait Env {
    fn var(&self, key: &str) -> Option<String>;
}

pub struct ProcessEnv;

impl Env for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

impl ProviderBlock {
    pub fn from_value(value: &serde_json::Value) -> anyhow::Result<Self> {
        crate::resources::decode_model(value)
    }

    /// Check values that can be checked without a database.
    pub fn validate(&self) -> Vec<Finding> {
        let mut findings = Vec::new();

        if let Some(port) = self.port {
            if !(1..=65535).contains(&port) {
                findings.push(Finding::error("port must be between 1 and 65535").at("port"));
            }
        }
        if let Some(mode) = &self.sslmode {
            if !SSL_MODES.contains(&mode.as_str()) {
                findings.push(
                    Finding::error(format!("unsupported sslmode {:?}", mode))
                        .with_detail(format!("expected one of: {}", SSL_MODES.join(", ")))
                        .at("sslmode"),
                );
            }
        }
        if let Some(max) = self.max_connections {
            if max < 1 {
                findings.push(
                    Finding::error("max_connections must be at least 1").at("max_connections"),
                );
            }
        }
        if let Some(timeout) = self.connect_timeout {
            if timeout < 0 {
                findings.push(
                    Finding::error("connect_timeout must not be negative").at("connect_timeout"),
                );
            }
        }
        if let Some(version) = &self.expected_version {
            if crate::client::version::ServerVersion::parse(version).is_err() {
                findings.push(
                    Finding::error(format!("invalid expected_version {:?}", version))
                        .at("expected_version"),
                );
            }
        }
        if self.jump_host.len() > 1 {
            findings.push(Finding::error("at most one jump_host block is allowed").at("jump_host"));
        }
        for jump in &self.jump_host {
            if jump.host.as_deref().unwrap_or_default().is_empty() {
                findings.push(Finding::error("jump_host requires host").at("jump_host"));
            }
            if let Some(key) = &jump.private_key_file {
                if !std::path::Path::new(key).exists() {
                    findings.push(
                        Finding::error(format!("private key file {:?} does not exist", key))
                            .at("jump_host"),
                    );
                }
            }
        }

        findings
    }

    pub fn resolve(&self, env: &dyn Env) -> ProviderConfig {
        let host = self
            .host
            .clone()
            .or_else(|| env.var("PGHOST"))
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = self
            .port
            .and_then(|p| u16::try_from(p).ok())
            .or_else(|| env.var("PGPORT").and_then(|p| p.parse().ok()))
            .unwrap_or(DEFAULT_PORT);
        let connect_timeout = self
            .connect_timeout
            .and_then(|t| u64::try_from(t).ok())
            .or_else(|| env.var("PGCONNECT_TIMEOUT").and_then(|t| t.parse().ok()))
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);

        ProviderConfig {
            host,
            port,
            database: self
                .database
                .clone()
                .or_else(|| env.var("PGDATABASE"))
                .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            username: self
                .username
                .clone()
                .or_else(|| env.var("PGUSER"))
                .unwrap_or_else(|| DEFAULT_USERNAME.to_string()),
            password: self.password.clone().or_else(|| env.var("PGPASSWORD")),
            database_username: self.database_username.clone(),
            superuser: self.superuser.unwrap_or(true),
            sslmode: self
                .sslmode
                .clone()
                .or_else(|| env.var("PGSSLMODE"))
                .unwrap_or_else(|| DEFAULT_SSLMODE.to_string()),
            sslrootcert: self
                .sslrootcert
                .clone()
                .or_else(|| env.var("PGSSLROOTCERT"))
                .map(PathBuf::from),
            connect_timeout: Duration::from_secs(connect_timeout),
            max_connections: self
                .max_connections
                .and_then(|m| u32::try_from(m).ok())
                .filter(|m| *m > 0)
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            expected_version: self.expected_version.clone(),
            application_name: self
                .application_name
                .clone()
                .unwrap_or_else(|| DEFAULT_APPLICATION_NAME.to_string()),
            jump_host: self.jump_host.first().map(|j| JumpHost {
                host: j.host.clone().unwrap_or_default(),
                port: j.port.and_then(|p| u16::try_from(p).ok()).unwrap_or(22),
                user: j.user.clone(),
                private_key_file: j.private_key_file.as_ref().map(PathBuf::from),
            }),
        }
    }
}

// ─── Schema ─────────────────────────────────────────────────────────────────

pub fn provider_schema() -> Block {
    Block::new(
        "PostgreSQL connection settings",
        vec![
            Attribute::optional("host", AttrType::String)
                .describe("Name of the PostgreSQL server address (PGHOST)"),
            Attribute::optional("port", AttrType::Number)
                .describe("The PostgreSQL port number (PGPORT)"),
            Attribute::optional("database", AttrType::String)
                .describe("The name of the database to connect to (PGDATABASE)"),
            Attribute::optional("username", AttrType::String)
                .describe("PostgreSQL user name to connect as (PGUSER)"),
            Attribute::optional("password", AttrType::String)
                .sensitive()
                .describe("Password to be used if the PostgreSQL server demands password authentication (PGPASSWORD)"),
            Attribute::optional("database_username", AttrType::String)
                .describe("Database username associated to the connected user (for user name maps)"),
            Attribute::optional("superuser", AttrType::Bool)
                .describe("Specify if the user to connect as is a PostgreSQL superuser"),
            Attribute::optional("sslmode", AttrType::String)
                .describe("SSL mode: disable, allow, prefer, require, verify-ca or verify-full (PGSSLMODE)"),
            Attribute::optional("sslrootcert", AttrType::String)
                .describe("The SSL server root certificate file path"),
            Attribute::optional("connect_timeout", AttrType::Number)
                .describe("Maximum wait for connection, in seconds (PGCONNECT_TIMEOUT)"),
            Attribute::optional("max_connections", AttrType::Number)
                .describe("Maximum number of connections to establish to the database"),
            Attribute::optional("expected_version", AttrType::String)
                .describe("Specify the expected version of PostgreSQL and skip detection"),
            Attribute::optional("application_name", AttrType::String)
                .describe("Application name reported to the server"),
        ],
    )
    .with_block(NestedBlock {
        type_name: "jump_host",
        block: Block::new(
            "SSH jump host used to reach the database",
            vec![
                Attribute::required("host", AttrType::String),
                Attribute::optional("port", AttrType::Number),
                Attribute::optional("user", AttrType::String),
                Attribute::optional("private_key_file", AttrType::String),
            ],
        ),
        nesting: Nesting::List,
        min_items: 0,
        max_items: 1,
    })
}

