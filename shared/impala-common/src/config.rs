//! Configuration for the Impala row client
//!
//! One configuration drives the whole client: the engine endpoints the pool
//! connects to, how many connections each endpoint gets, retry cadences for
//! reconnects and table bootstrap, the bounded waits used between components,
//! and the size of the insert/query worker sets.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Beeswax port the engine daemons listen on by default
pub const DEFAULT_PORT: u16 = 21000;

/// One engine endpoint, written `host[:port]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAddr {
    pub host: String,
    pub port: u16,
}

impl HostAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for HostAddr {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }

        match value.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(anyhow!("host missing in '{}'", value));
                }
                let port: u16 = port
                    .parse()
                    .with_context(|| format!("Invalid port in host '{}'", value))?;
                if port == 0 {
                    return Err(anyhow!("port must be greater than 0 in '{}'", value));
                }
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(value, DEFAULT_PORT)),
        }
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Impala client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Engine endpoints (`host[:port]`)
    pub hosts: Vec<String>,
    /// Pooled connections started per host
    pub connections_per_host: usize,
    /// Database used for schemas that do not name one
    pub default_database: String,
    /// Delay before a failed connection retries, in milliseconds
    pub reconnect_backoff_ms: u64,
    /// Delay before a failed table existence check retries, in milliseconds
    pub table_check_backoff_ms: u64,
    /// Bounded wait for a lease grant, in milliseconds
    pub lease_timeout_ms: u64,
    /// Bounded wait for insert/query/table replies, in milliseconds
    pub request_timeout_ms: u64,
    /// Fetch-polling deadline for a single statement, in milliseconds
    pub statement_timeout_ms: u64,
    /// Delay between fetch polls while a result is not ready, in milliseconds
    pub fetch_poll_interval_ms: u64,
    /// Number of bulk insert workers
    pub insert_workers: usize,
    /// Number of query workers
    pub query_workers: usize,
    /// Default tablet replica count for schemas that do not declare one
    pub replication_factor: Option<u32>,
    /// Client instance ID
    pub instance_id: String,
}

impl ClientConfig {
    /// Load configuration from a properties map
    ///
    /// Properties:
    /// - impala_hosts (comma separated), impala_connections_per_host
    /// - impala_default_database
    /// - impala_reconnect_backoff_ms, impala_table_check_backoff_ms
    /// - impala_lease_timeout_ms, impala_request_timeout_ms
    /// - impala_statement_timeout_ms, impala_fetch_poll_interval_ms
    /// - impala_insert_workers, impala_query_workers
    /// - impala_replication_factor, impala_instance_id
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self> {
        fn parse<T: FromStr>(props: &HashMap<String, String>, key: &str, default: T) -> T {
            props
                .get(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        }

        let defaults = Self::default();

        let hosts = props
            .get("impala_hosts")
            .map(|v| split_hosts(v))
            .context("impala_hosts property is required")?;

        let config = Self {
            hosts,
            connections_per_host: parse(
                props,
                "impala_connections_per_host",
                defaults.connections_per_host,
            ),
            default_database: props
                .get("impala_default_database")
                .cloned()
                .unwrap_or(defaults.default_database),
            reconnect_backoff_ms: parse(
                props,
                "impala_reconnect_backoff_ms",
                defaults.reconnect_backoff_ms,
            ),
            table_check_backoff_ms: parse(
                props,
                "impala_table_check_backoff_ms",
                defaults.table_check_backoff_ms,
            ),
            lease_timeout_ms: parse(props, "impala_lease_timeout_ms", defaults.lease_timeout_ms),
            request_timeout_ms: parse(
                props,
                "impala_request_timeout_ms",
                defaults.request_timeout_ms,
            ),
            statement_timeout_ms: parse(
                props,
                "impala_statement_timeout_ms",
                defaults.statement_timeout_ms,
            ),
            fetch_poll_interval_ms: parse(
                props,
                "impala_fetch_poll_interval_ms",
                defaults.fetch_poll_interval_ms,
            ),
            insert_workers: parse(props, "impala_insert_workers", defaults.insert_workers),
            query_workers: parse(props, "impala_query_workers", defaults.query_workers),
            replication_factor: props
                .get("impala_replication_factor")
                .and_then(|v| v.trim().parse().ok()),
            instance_id: props
                .get("impala_instance_id")
                .cloned()
                .unwrap_or(defaults.instance_id),
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables mirror the property names in upper case
    /// (IMPALA_HOSTS, IMPALA_CONNECTIONS_PER_HOST, ...). IMPALA_HOSTS is required.
    pub fn from_env() -> Result<Self> {
        let mut props = HashMap::new();
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix("IMPALA_") {
                props.insert(format!("impala_{}", stripped.to_lowercase()), value);
            }
        }

        if !props.contains_key("impala_hosts") {
            return Err(anyhow!("IMPALA_HOSTS environment variable is required"));
        }

        Self::from_properties(&props)
    }

    /// Parse every configured host
    pub fn host_addrs(&self) -> Result<Vec<HostAddr>> {
        self.hosts
            .iter()
            .map(|h| {
                h.parse::<HostAddr>()
                    .with_context(|| format!("Invalid host entry: {}", h))
            })
            .collect()
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn table_check_backoff(&self) -> Duration {
        Duration::from_millis(self.table_check_backoff_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }

    pub fn fetch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_poll_interval_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(anyhow!("At least one host must be configured"));
        }
        self.host_addrs()?;

        if self.connections_per_host == 0 {
            return Err(anyhow!("Connections per host must be greater than 0"));
        }
        if self.insert_workers == 0 {
            return Err(anyhow!("Insert workers must be greater than 0"));
        }
        if self.query_workers == 0 {
            return Err(anyhow!("Query workers must be greater than 0"));
        }
        if self.default_database.trim().is_empty() {
            return Err(anyhow!("Default database cannot be empty"));
        }

        for (name, value) in [
            ("lease_timeout_ms", self.lease_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("statement_timeout_ms", self.statement_timeout_ms),
        ] {
            if value == 0 {
                return Err(anyhow!("{} must be greater than 0", name));
            }
        }

        if self.replication_factor == Some(0) {
            return Err(anyhow!("Replication factor must be greater than 0"));
        }

        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hosts: vec![format!("localhost:{}", DEFAULT_PORT)],
            connections_per_host: 2,
            default_database: "default".to_string(),
            reconnect_backoff_ms: 10_000,
            table_check_backoff_ms: 30_000,
            lease_timeout_ms: 60_000,
            request_timeout_ms: 300_000,
            statement_timeout_ms: 30_000,
            fetch_poll_interval_ms: 10,
            insert_workers: 5,
            query_workers: 5,
            replication_factor: None,
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

fn split_hosts(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}
