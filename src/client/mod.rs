pub mod retry;
pub mod tunnel;
pub mod version;

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::{Postgres, Transaction};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use self::retry::Backoff;
use self::tunnel::Tunnel;
use self::version::ServerVersion;
use crate::config::ProviderConfig;

const SESSION_BACKOFF: Backoff = Backoff::new(2, Duration::from_millis(250), Duration::from_secs(2));

/// Facts about the connected session, queried once per client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub version: ServerVersion,
    pub current_user: String,
    /// Configured `superuser` and the catalog agree the user is a superuser.
    pub superuser: bool,
}

/// Database access for resource handlers.
///
/// Holds one lazily connected pool per DSN. Handlers that work inside a
/// specific database (grants, schemas, extensions) get a pool for that
/// database; everything else uses the configured default database.
pub struct Client {
    config: ProviderConfig,
    host: String,
    port: u16,
    pools: DashMap<String, PgPool>,
    session: OnceCell<Session>,
    _tunnel: Option<Tunnel>,
}

impl Client {
    /// Build a client. Opens the SSH tunnel when a jump host is configured;
    /// database connections are established on first use.
    pub async fn new(config: ProviderConfig) -> Result<Self> {
        let (host, port, tunnel) = match &config.jump_host {
            Some(jump) => {
                let tunnel = Tunnel::open(jump, &config.host, config.port).await?;
                ("127.0.0.1".to_string(), tunnel.local_port, Some(tunnel))
            }
            None => (config.host.clone(), config.port, None),
        };

        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            username = %config.username,
            tunneled = tunnel.is_some(),
            "PostgreSQL client configured"
        );

        Ok(Self {
            config,
            host,
            port,
            pools: DashMap::new(),
            session: OnceCell::new(),
            _tunnel: tunnel,
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn default_database(&self) -> &str {
        &self.config.database
    }

    /// Pool cache key. The password is not part of the key.
    pub fn dsn(&self, database: &str) -> String {
        format!(
            "host={} port={} user={} dbname={} sslmode={}",
            self.host, self.port, self.config.username, database, self.config.sslmode
        )
    }

    fn connect_options(&self, database: &str) -> Result<PgConnectOptions> {
        let ssl_mode = PgSslMode::from_str(&self.config.sslmode)
            .with_context(|| format!("Invalid sslmode {:?}", self.config.sslmode))?;
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.config.username)
            .database(database)
            .ssl_mode(ssl_mode)
            .application_name(&self.config.application_name);
        if let Some(password) = &self.config.password {
            options = options.password(password);
        }
        if let Some(root_cert) = &self.config.sslrootcert {
            options = options.ssl_root_cert(root_cert);
        }
        Ok(options)
    }

    /// Pool for `database`, or for the default database when `None`.
    pub fn pool(&self, database: Option<&str>) -> Result<PgPool> {
        let database = database.unwrap_or(&self.config.database);
        let dsn = self.dsn(database);
        if let Some(pool) = self.pools.get(&dsn) {
            return Ok(pool.clone());
        }

        let options = self.connect_options(database)?;
        let pool = self
            .pools
            .entry(dsn)
            .or_insert_with(|| {
                debug!(database, "Creating connection pool");
                PgPoolOptions::new()
                    .max_connections(self.config.max_connections)
                    .acquire_timeout(self.config.connect_timeout)
                    .connect_lazy_with(options)
            })
            .clone();
        Ok(pool)
    }

    /// Start a transaction in `database` (default database when `None`).
    pub async fn begin(&self, database: Option<&str>) -> Result<Transaction<'static, Postgres>> {
        let pool = self.pool(database)?;
        let db = database.unwrap_or(&self.config.database).to_string();
        pool.begin()
            .await
            .with_context(|| format!("Failed to start transaction on database {:?}", db))
    }

    /// A bare connection, for statements that refuse to run in a transaction
    /// block (`CREATE DATABASE`, `ALTER DATABASE ... SET TABLESPACE`).
    pub async fn acquire(&self, database: Option<&str>) -> Result<PoolConnection<Postgres>> {
        let pool = self.pool(database)?;
        let db = database.unwrap_or(&self.config.database).to_string();
        pool.acquire()
            .await
            .with_context(|| format!("Failed to connect to database {:?}", db))
    }

    pub async fn session(&self) -> Result<&Session> {
        self.session.get_or_try_init(|| self.load_session()).await
    }

    pub async fn version(&self) -> Result<ServerVersion> {
        Ok(self.session().await?.version)
    }

    async fn load_session(&self) -> Result<Session> {
        let pool = self.pool(None)?;
        let (version_num, current_user, rolsuper): (i32, String, bool) = SESSION_BACKOFF
            .run("session lookup", || {
                sqlx::query_as::<_, (i32, String, bool)>(
                    "SELECT current_setting('server_version_num')::int, current_user::text, r.rolsuper \
                     FROM pg_catalog.pg_roles r WHERE r.rolname = current_user",
                )
                .fetch_one(&pool)
            })
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to PostgreSQL at {}:{}",
                    self.config.host, self.config.port
                )
            })?;

        let version = match &self.config.expected_version {
            Some(expected) => ServerVersion::parse(expected)?,
            None => ServerVersion::new(version_num),
        };
        let session = Session {
            version,
            current_user: self
                .config
                .database_username
                .clone()
                .unwrap_or(current_user),
            superuser: self.config.superuser && rolsuper,
        };
        info!(
            version = %session.version,
            current_user = %session.current_user,
            superuser = session.superuser,
            "Connected to PostgreSQL"
        );
        Ok(session)
    }
}
