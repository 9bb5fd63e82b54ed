//! Connection pool
//!
//! Pooled connections are opened per configured host at start. Each one
//! registers with the pool once it is connected; the pool hands lease
//! requests only to registered idle connections and keeps the rest waiting
//! in arrival order.

mod connection;
mod lease;
mod manager;

pub use connection::{ConnectionHandle, ConnectionState};
pub use lease::ConnectionLease;
pub use manager::PoolStatus;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use impala_common::{ClientConfig, ImpalaError, ImpalaResult, ServiceConnector};

use crate::mailbox::{ask, Reply};
use crate::tasks::TaskSet;
use connection::PooledConnection;
use manager::ConnectionPool;

/// Index of a pooled connection, stable across reconnects
pub type ConnectionId = usize;

/// Timing shared by the pool and its connections
#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolSettings {
    pub reconnect_backoff: Duration,
    pub poll_interval: Duration,
    pub statement_timeout: Duration,
    pub request_timeout: Duration,
    pub lease_timeout: Duration,
}

impl PoolSettings {
    pub(crate) fn from_config(config: &ClientConfig) -> Self {
        Self {
            reconnect_backoff: config.reconnect_backoff(),
            poll_interval: config.fetch_poll_interval(),
            statement_timeout: config.statement_timeout(),
            request_timeout: config.request_timeout(),
            lease_timeout: config.lease_timeout(),
        }
    }
}

pub(crate) struct LeaseRequest {
    pub holder: String,
    pub reply: Reply<ConnectionLease>,
}

pub(crate) enum PoolMessage {
    RequestLease(LeaseRequest),
    /// A connection could not grant and handed the request back
    Bounced {
        id: ConnectionId,
        request: LeaseRequest,
    },
    Join(ConnectionId),
    Leave(ConnectionId),
    Available(ConnectionId),
    Status(oneshot::Sender<PoolStatus>),
}

/// Address of the running pool
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::UnboundedSender<PoolMessage>,
    connections: Arc<Vec<ConnectionHandle>>,
    settings: PoolSettings,
}

impl PoolHandle {
    /// Spawn one connection task per host and slot, plus the pool task
    pub fn start(
        config: &ClientConfig,
        connector: Arc<dyn ServiceConnector>,
        tasks: &TaskSet,
    ) -> ImpalaResult<Self> {
        let hosts = config.host_addrs()?;
        let settings = PoolSettings::from_config(config);
        let (tx, inbox) = mpsc::unbounded_channel();

        let mut connections = Vec::with_capacity(hosts.len() * config.connections_per_host);
        for _ in 0..config.connections_per_host {
            for host in &hosts {
                let (connection, handle) = PooledConnection::new(
                    connections.len(),
                    host.clone(),
                    Arc::clone(&connector),
                    tx.clone(),
                    settings,
                    tasks.clone(),
                );
                tasks.spawn(connection.run());
                connections.push(handle);
            }
        }

        info!(
            hosts = hosts.len(),
            connections = connections.len(),
            "Starting connection pool"
        );

        tasks.spawn(ConnectionPool::new(inbox, connections.clone()).run());

        Ok(Self {
            tx,
            connections: Arc::new(connections),
            settings,
        })
    }

    /// Wait for an exclusive lease on any registered connection
    pub async fn request_lease(&self, holder: &str) -> ImpalaResult<ConnectionLease> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolMessage::RequestLease(LeaseRequest {
                holder: holder.to_string(),
                reply,
            }))
            .map_err(|_| ImpalaError::Shutdown("connection pool is gone".to_string()))?;
        ask(rx, self.settings.lease_timeout, "lease request").await
    }

    pub async fn status(&self) -> ImpalaResult<PoolStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolMessage::Status(reply))
            .map_err(|_| ImpalaError::Shutdown("connection pool is gone".to_string()))?;
        match tokio::time::timeout(self.settings.request_timeout, rx).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(ImpalaError::Shutdown("connection pool is gone".to_string())),
            Err(_) => Err(ImpalaError::Timeout(
                "connection pool did not report its status".to_string(),
            )),
        }
    }

    pub fn connections(&self) -> &[ConnectionHandle] {
        &self.connections
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&ConnectionHandle> {
        self.connections.get(id)
    }
}
