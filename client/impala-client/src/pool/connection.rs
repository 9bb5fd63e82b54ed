//! One pooled connection and its connect/lease state machine
//!
//! ```text
//! Connecting -> Idle -> Leased -> Idle
//!                          \-> Connecting (transport failure)
//! ```
//!
//! A connection joins the pool once its session is open and has answered a
//! health probe. A failed connect is retried after the reconnect backoff.
//! Statements run one at a time under the current lease; messages arriving
//! meanwhile wait in the inbox in arrival order. A transport failure makes
//! the connection leave the pool, drop its lease and reconnect from scratch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use impala_common::{
    HostAddr, ImpalaError, ImpalaResult, InsertResult, QueryResponse, ServiceConnector,
};

use super::lease::ConnectionLease;
use super::{ConnectionId, LeaseRequest, PoolMessage, PoolSettings};
use crate::mailbox::{ask, Reply};
use crate::session::Session;
use crate::tasks::TaskSet;

/// Externally visible connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Idle,
    Leased,
}

pub(crate) enum ConnectionMessage {
    Connected(ImpalaResult<Session>),
    Reconnect,
    AcquireLease(LeaseRequest),
    Query {
        lease_id: Uuid,
        statement: String,
        reply: Reply<QueryResponse>,
    },
    Insert {
        lease_id: Uuid,
        statement: String,
        reply: Reply<InsertResult>,
    },
    Release {
        lease_id: Uuid,
        reply: Option<Reply<()>>,
    },
    State(oneshot::Sender<ConnectionState>),
}

/// Address of one pooled connection
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    host: HostAddr,
    tx: mpsc::UnboundedSender<ConnectionMessage>,
    settings: PoolSettings,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn host(&self) -> &HostAddr {
        &self.host
    }

    pub async fn state(&self) -> ImpalaResult<ConnectionState> {
        let (tx, rx) = oneshot::channel();
        self.send(ConnectionMessage::State(tx))?;
        match tokio::time::timeout(self.settings.request_timeout, rx).await {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(_)) => Err(ImpalaError::Shutdown(format!("connection {} is gone", self.id))),
            Err(_) => Err(ImpalaError::Timeout(format!(
                "connection {} did not report its state",
                self.id
            ))),
        }
    }

    pub async fn query(&self, lease_id: Uuid, statement: &str) -> ImpalaResult<QueryResponse> {
        let (tx, rx) = oneshot::channel();
        self.send(ConnectionMessage::Query {
            lease_id,
            statement: statement.to_string(),
            reply: tx,
        })?;
        ask(rx, self.settings.request_timeout, "connection query").await
    }

    pub async fn insert(&self, lease_id: Uuid, statement: &str) -> ImpalaResult<InsertResult> {
        let (tx, rx) = oneshot::channel();
        self.send(ConnectionMessage::Insert {
            lease_id,
            statement: statement.to_string(),
            reply: tx,
        })?;
        ask(rx, self.settings.request_timeout, "connection insert").await
    }

    /// Release a lease; ids other than the current lease are rejected
    pub async fn release(&self, lease_id: Uuid) -> ImpalaResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ConnectionMessage::Release {
            lease_id,
            reply: Some(tx),
        })?;
        ask(rx, self.settings.request_timeout, "connection release").await
    }

    pub(crate) fn release_detached(&self, lease_id: Uuid) {
        let _ = self.tx.send(ConnectionMessage::Release {
            lease_id,
            reply: None,
        });
    }

    pub(crate) fn send(&self, message: ConnectionMessage) -> ImpalaResult<()> {
        self.tx
            .send(message)
            .map_err(|_| ImpalaError::Shutdown(format!("connection {} is gone", self.id)))
    }

    pub(crate) fn try_send(
        &self,
        message: ConnectionMessage,
    ) -> Result<(), mpsc::error::SendError<ConnectionMessage>> {
        self.tx.send(message)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("host", &self.host)
            .finish()
    }
}

enum State {
    Connecting,
    Idle,
    Leased { lease_id: Uuid, holder: String },
}

impl State {
    fn kind(&self) -> ConnectionState {
        match self {
            State::Connecting => ConnectionState::Connecting,
            State::Idle => ConnectionState::Idle,
            State::Leased { .. } => ConnectionState::Leased,
        }
    }
}

/// Task owning one RPC connection
pub(crate) struct PooledConnection {
    handle: ConnectionHandle,
    inbox: mpsc::UnboundedReceiver<ConnectionMessage>,
    connector: Arc<dyn ServiceConnector>,
    pool: mpsc::UnboundedSender<PoolMessage>,
    tasks: TaskSet,
    state: State,
    session: Option<Session>,
}

impl PooledConnection {
    pub(crate) fn new(
        id: ConnectionId,
        host: HostAddr,
        connector: Arc<dyn ServiceConnector>,
        pool: mpsc::UnboundedSender<PoolMessage>,
        settings: PoolSettings,
        tasks: TaskSet,
    ) -> (Self, ConnectionHandle) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            id,
            host,
            tx,
            settings,
        };
        let connection = Self {
            handle: handle.clone(),
            inbox,
            connector,
            pool,
            tasks,
            state: State::Connecting,
            session: None,
        };
        (connection, handle)
    }

    #[instrument(skip(self), fields(connection_id = self.handle.id, host = %self.handle.host))]
    pub(crate) async fn run(mut self) {
        self.start_connect();
        while let Some(message) = self.inbox.recv().await {
            self.handle_message(message).await;
        }
        debug!("Connection inbox closed");
    }

    async fn handle_message(&mut self, message: ConnectionMessage) {
        match message {
            ConnectionMessage::State(reply) => {
                let _ = reply.send(self.state.kind());
            }
            ConnectionMessage::Connected(result) => self.on_connected(result),
            ConnectionMessage::Reconnect => {
                if matches!(self.state, State::Connecting) {
                    self.start_connect();
                }
            }
            ConnectionMessage::AcquireLease(request) => self.grant(request),
            ConnectionMessage::Query {
                lease_id,
                statement,
                reply,
            } => {
                let result = match self.check_lease(lease_id) {
                    Ok(()) => self.run_query(&statement).await,
                    Err(e) => Err(e),
                };
                self.after_statement(&result);
                let _ = reply.send(result);
            }
            ConnectionMessage::Insert {
                lease_id,
                statement,
                reply,
            } => {
                let result = match self.check_lease(lease_id) {
                    Ok(()) => self.run_insert(&statement).await,
                    Err(e) => Err(e),
                };
                self.after_statement(&result);
                let _ = reply.send(result);
            }
            ConnectionMessage::Release { lease_id, reply } => {
                let result = self.check_lease(lease_id);
                match &result {
                    Ok(()) => {
                        debug!(lease_id = %lease_id, "Lease released");
                        self.state = State::Idle;
                        let _ = self.pool.send(PoolMessage::Available(self.handle.id));
                    }
                    Err(e) => warn!(lease_id = %lease_id, error = %e, "Rejected release"),
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
    }

    fn start_connect(&self) {
        let connector = Arc::clone(&self.connector);
        let host = self.handle.host.clone();
        let tx = self.handle.tx.clone();
        let settings = self.handle.settings;
        self.tasks.spawn(async move {
            let result: ImpalaResult<Session> = async {
                let service = connector.connect(&host).await?;
                let mut session =
                    Session::new(service, settings.poll_interval, settings.statement_timeout);
                session.probe().await?;
                Ok(session)
            }
            .await;
            let _ = tx.send(ConnectionMessage::Connected(result));
        });
    }

    fn on_connected(&mut self, result: ImpalaResult<Session>) {
        if !matches!(self.state, State::Connecting) {
            return;
        }
        match result {
            Ok(session) => {
                info!("Connection established");
                self.session = Some(session);
                self.state = State::Idle;
                let _ = self.pool.send(PoolMessage::Join(self.handle.id));
            }
            Err(e) => {
                let backoff = self.handle.settings.reconnect_backoff;
                warn!(error = %e, retry_in = ?backoff, "Could not open connection, will retry");
                let tx = self.handle.tx.clone();
                self.tasks.spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let _ = tx.send(ConnectionMessage::Reconnect);
                });
            }
        }
    }

    fn grant(&mut self, request: LeaseRequest) {
        if !matches!(self.state, State::Idle) {
            debug!(holder = %request.holder, "Not idle, returning lease request to the pool");
            let _ = self.pool.send(PoolMessage::Bounced {
                id: self.handle.id,
                request,
            });
            return;
        }

        if request.reply.is_closed() {
            debug!(holder = %request.holder, "Lease requester gave up");
            let _ = self.pool.send(PoolMessage::Available(self.handle.id));
            return;
        }

        let lease_id = Uuid::new_v4();
        debug!(lease_id = %lease_id, holder = %request.holder, "Lease granted");
        self.state = State::Leased {
            lease_id,
            holder: request.holder.clone(),
        };
        // A lease that cannot be delivered is dropped here and releases itself
        let lease = ConnectionLease::new(self.handle.clone(), lease_id, request.holder);
        let _ = request.reply.send(Ok(lease));
    }

    fn check_lease(&self, lease_id: Uuid) -> ImpalaResult<()> {
        match &self.state {
            State::Leased { lease_id: current, .. } if *current == lease_id => Ok(()),
            _ => Err(ImpalaError::LeaseRejected(format!(
                "{} is not the current lease of connection {}",
                lease_id, self.handle.id
            ))),
        }
    }

    async fn run_query(&mut self, statement: &str) -> ImpalaResult<QueryResponse> {
        match self.session.as_mut() {
            Some(session) => session.query(statement).await,
            None => Err(ImpalaError::Transport("connection has no open session".to_string())),
        }
    }

    async fn run_insert(&mut self, statement: &str) -> ImpalaResult<InsertResult> {
        match self.session.as_mut() {
            Some(session) => session.insert(statement).await,
            None => Err(ImpalaError::Transport("connection has no open session".to_string())),
        }
    }

    /// Server errors leave the lease in place; transport errors recycle the connection
    fn after_statement<T>(&mut self, result: &ImpalaResult<T>) {
        let Err(e) = result else { return };
        if !e.is_transport() {
            return;
        }
        if let State::Leased { lease_id, holder } = &self.state {
            warn!(lease_id = %lease_id, holder = %holder, error = %e, "Transport failure, leaving pool");
        }
        self.session = None;
        self.state = State::Connecting;
        let _ = self.pool.send(PoolMessage::Leave(self.handle.id));
        self.start_connect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utilities::{FakeCluster, FakeConnector};
    use std::time::Duration;

    fn settings() -> PoolSettings {
        PoolSettings {
            reconnect_backoff: Duration::from_millis(20),
            poll_interval: Duration::from_millis(1),
            statement_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            lease_timeout: Duration::from_secs(5),
        }
    }

    fn start(
        cluster: &FakeCluster,
    ) -> (
        ConnectionHandle,
        mpsc::UnboundedReceiver<PoolMessage>,
        TaskSet,
    ) {
        let tasks = TaskSet::new();
        let (pool_tx, pool_rx) = mpsc::unbounded_channel();
        let (connection, handle) = PooledConnection::new(
            0,
            HostAddr::new("impala-1", 21000),
            Arc::new(FakeConnector::new(cluster.clone())),
            pool_tx,
            settings(),
            tasks.clone(),
        );
        tasks.spawn(connection.run());
        (handle, pool_rx, tasks)
    }

    async fn lease(handle: &ConnectionHandle) -> ConnectionLease {
        let (tx, rx) = oneshot::channel();
        handle
            .send(ConnectionMessage::AcquireLease(LeaseRequest {
                holder: "test".to_string(),
                reply: tx,
            }))
            .unwrap();
        rx.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_joins_pool_after_probe() {
        let cluster = FakeCluster::new();
        let (handle, mut pool_rx, tasks) = start(&cluster);

        assert!(matches!(pool_rx.recv().await, Some(PoolMessage::Join(0))));
        assert_eq!(handle.state().await.unwrap(), ConnectionState::Idle);
        tasks.abort_all();
    }

    #[tokio::test]
    async fn test_retries_refused_connects() {
        let cluster = FakeCluster::new();
        cluster.refuse_connections(true);
        let (handle, mut pool_rx, tasks) = start(&cluster);

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(handle.state().await.unwrap(), ConnectionState::Connecting);
        assert!(cluster.connect_attempts() >= 2);

        cluster.refuse_connections(false);
        assert!(matches!(pool_rx.recv().await, Some(PoolMessage::Join(0))));
        tasks.abort_all();
    }

    #[tokio::test]
    async fn test_stale_lease_is_rejected() {
        let cluster = FakeCluster::new();
        let (handle, mut pool_rx, tasks) = start(&cluster);
        pool_rx.recv().await;

        let lease = lease(&handle).await;
        let stale = Uuid::new_v4();
        assert!(matches!(
            handle.query(stale, "show tables;").await,
            Err(ImpalaError::LeaseRejected(_))
        ));
        assert!(matches!(
            handle.release(stale).await,
            Err(ImpalaError::LeaseRejected(_))
        ));
        assert_eq!(handle.state().await.unwrap(), ConnectionState::Leased);

        lease.release_and_wait().await.unwrap();
        assert_eq!(handle.state().await.unwrap(), ConnectionState::Idle);
        assert!(matches!(pool_rx.recv().await, Some(PoolMessage::Available(0))));
        tasks.abort_all();
    }

    #[tokio::test]
    async fn test_second_lease_request_is_bounced() {
        let cluster = FakeCluster::new();
        let (handle, mut pool_rx, tasks) = start(&cluster);
        pool_rx.recv().await;

        let _lease = lease(&handle).await;
        let (tx, _rx) = oneshot::channel();
        handle
            .send(ConnectionMessage::AcquireLease(LeaseRequest {
                holder: "second".to_string(),
                reply: tx,
            }))
            .unwrap();

        match pool_rx.recv().await {
            Some(PoolMessage::Bounced { id, request }) => {
                assert_eq!(id, 0);
                assert_eq!(request.holder, "second");
            }
            _ => panic!("expected the request to bounce"),
        }
        tasks.abort_all();
    }

    #[tokio::test]
    async fn test_server_error_keeps_lease() {
        let cluster = FakeCluster::new();
        cluster.fail_statements_matching("bogus", ImpalaError::Server("syntax error".into()));
        let (handle, mut pool_rx, tasks) = start(&cluster);
        pool_rx.recv().await;

        let lease = lease(&handle).await;
        assert!(matches!(
            lease.query("select bogus").await,
            Err(ImpalaError::Server(_))
        ));
        assert_eq!(handle.state().await.unwrap(), ConnectionState::Leased);
        assert!(lease.query("show tables;").await.is_ok());
        tasks.abort_all();
    }

    #[tokio::test]
    async fn test_transport_error_leaves_pool_and_reconnects() {
        let cluster = FakeCluster::new();
        cluster.fail_statements_matching("boom", ImpalaError::Transport("broken pipe".into()));
        let (handle, mut pool_rx, tasks) = start(&cluster);
        pool_rx.recv().await;

        let lease = lease(&handle).await;
        let lease_id = lease.lease_id();
        assert!(lease.query("select boom").await.unwrap_err().is_transport());
        assert!(matches!(pool_rx.recv().await, Some(PoolMessage::Leave(0))));

        // The old lease is gone
        assert!(matches!(
            handle.query(lease_id, "show tables;").await,
            Err(ImpalaError::LeaseRejected(_))
        ));
        drop(lease);

        assert!(matches!(pool_rx.recv().await, Some(PoolMessage::Join(0))));
        tasks.abort_all();
    }

    #[tokio::test]
    async fn test_dropped_lease_releases_itself() {
        let cluster = FakeCluster::new();
        let (handle, mut pool_rx, tasks) = start(&cluster);
        pool_rx.recv().await;

        drop(lease(&handle).await);
        assert!(matches!(pool_rx.recv().await, Some(PoolMessage::Available(0))));
        assert_eq!(handle.state().await.unwrap(), ConnectionState::Idle);
        tasks.abort_all();
    }
}
