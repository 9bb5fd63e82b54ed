//! Pool task: membership and lease dispatch

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::connection::{ConnectionHandle, ConnectionMessage};
use super::{ConnectionId, LeaseRequest, PoolMessage};

/// Snapshot of pool membership
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Connections started, registered or not
    pub connections: usize,
    pub registered: usize,
    pub idle: usize,
    pub leased: usize,
    /// Lease requests waiting for an idle connection
    pub pending: usize,
}

struct Member {
    handle: ConnectionHandle,
    registered: bool,
    idle: bool,
    grants: u64,
}

pub(crate) struct ConnectionPool {
    inbox: mpsc::UnboundedReceiver<PoolMessage>,
    members: BTreeMap<ConnectionId, Member>,
    pending: VecDeque<LeaseRequest>,
}

impl ConnectionPool {
    pub(crate) fn new(
        inbox: mpsc::UnboundedReceiver<PoolMessage>,
        connections: Vec<ConnectionHandle>,
    ) -> Self {
        let members = connections
            .into_iter()
            .map(|handle| {
                (
                    handle.id(),
                    Member {
                        handle,
                        registered: false,
                        idle: false,
                        grants: 0,
                    },
                )
            })
            .collect();
        Self {
            inbox,
            members,
            pending: VecDeque::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        while let Some(message) = self.inbox.recv().await {
            self.handle_message(message);
        }
        debug!("Pool inbox closed");
    }

    fn handle_message(&mut self, message: PoolMessage) {
        match message {
            PoolMessage::RequestLease(request) => {
                self.pending.push_back(request);
                if self.registered() == 0 {
                    debug!(pending = self.pending.len(), "No registered connections, buffering lease request");
                }
            }
            PoolMessage::Bounced { id, request } => {
                if let Some(member) = self.members.get_mut(&id) {
                    member.idle = false;
                }
                self.pending.push_front(request);
            }
            PoolMessage::Join(id) => {
                if let Some(member) = self.members.get_mut(&id) {
                    member.registered = true;
                    member.idle = true;
                    info!(connection_id = id, host = %member.handle.host(), "Connection joined pool");
                }
            }
            PoolMessage::Leave(id) => {
                if let Some(member) = self.members.get_mut(&id) {
                    member.registered = false;
                    member.idle = false;
                    warn!(connection_id = id, host = %member.handle.host(), "Connection left pool");
                }
                if self.registered() == 0 {
                    warn!("No registered connections left, lease requests will wait");
                }
            }
            PoolMessage::Available(id) => {
                if let Some(member) = self.members.get_mut(&id) {
                    if member.registered {
                        member.idle = true;
                    }
                }
            }
            PoolMessage::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
        self.dispatch();
    }

    fn registered(&self) -> usize {
        self.members.values().filter(|m| m.registered).count()
    }

    /// Idle registered connection with the fewest grants so far
    fn select(&self) -> Option<ConnectionId> {
        self.members
            .iter()
            .filter(|(_, m)| m.registered && m.idle)
            .min_by_key(|(id, m)| (m.grants, **id))
            .map(|(id, _)| *id)
    }

    fn dispatch(&mut self) {
        while !self.pending.is_empty() {
            let Some(id) = self.select() else { break };
            let Some(request) = self.pending.pop_front() else { break };

            if request.reply.is_closed() {
                debug!(holder = %request.holder, "Dropping abandoned lease request");
                continue;
            }

            let Some(member) = self.members.get_mut(&id) else { break };
            member.idle = false;
            member.grants += 1;
            debug!(connection_id = id, holder = %request.holder, "Forwarding lease request");

            if let Err(err) = member
                .handle
                .try_send(ConnectionMessage::AcquireLease(request))
            {
                warn!(connection_id = id, "Connection task is gone, removing it from the pool");
                member.registered = false;
                if let ConnectionMessage::AcquireLease(request) = err.0 {
                    self.pending.push_front(request);
                }
            }
        }
    }

    fn status(&self) -> PoolStatus {
        let registered = self.registered();
        let idle = self
            .members
            .values()
            .filter(|m| m.registered && m.idle)
            .count();
        PoolStatus {
            connections: self.members.len(),
            registered,
            idle,
            leased: registered - idle,
            pending: self.pending.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::pool::PoolHandle;
    use crate::tasks::TaskSet;
    use crate::test_utilities::{FakeCluster, FakeConnector};
    use impala_common::{ClientConfig, ImpalaError};
    use std::sync::Arc;
    use std::time::Duration;

    fn config(hosts: &[&str], per_host: usize) -> ClientConfig {
        ClientConfig {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            connections_per_host: per_host,
            reconnect_backoff_ms: 20,
            lease_timeout_ms: 2_000,
            fetch_poll_interval_ms: 1,
            ..ClientConfig::default()
        }
    }

    async fn wait_for_registered(pool: &PoolHandle, expected: usize) {
        for _ in 0..200 {
            if pool.status().await.unwrap().registered == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pool never reached {expected} registered connections");
    }

    #[tokio::test]
    async fn test_requests_wait_until_a_connection_joins() {
        let cluster = FakeCluster::new();
        cluster.refuse_connections(true);
        let tasks = TaskSet::new();
        let pool = PoolHandle::start(
            &config(&["impala-1"], 1),
            Arc::new(FakeConnector::new(cluster.clone())),
            &tasks,
        )
        .unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.request_lease("waiter").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let status = pool.status().await.unwrap();
        assert_eq!(status.registered, 0);
        assert_eq!(status.pending, 1);

        cluster.refuse_connections(false);
        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(lease.connection_id(), 0);
        tasks.abort_all();
    }

    #[tokio::test]
    async fn test_leases_spread_over_idle_connections() {
        let cluster = FakeCluster::new();
        let tasks = TaskSet::new();
        let pool = PoolHandle::start(
            &config(&["impala-1", "impala-2"], 1),
            Arc::new(FakeConnector::new(cluster.clone())),
            &tasks,
        )
        .unwrap();
        wait_for_registered(&pool, 2).await;

        let first = pool.request_lease("a").await.unwrap();
        let second = pool.request_lease("b").await.unwrap();
        assert_ne!(first.connection_id(), second.connection_id());

        let status = pool.status().await.unwrap();
        assert_eq!(status.leased, 2);
        assert_eq!(status.idle, 0);

        // Third request waits for a release
        let third = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.request_lease("c").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.status().await.unwrap().pending, 1);

        let released = first.connection_id();
        first.release_and_wait().await.unwrap();
        let third = third.await.unwrap().unwrap();
        assert_eq!(third.connection_id(), released);
        tasks.abort_all();
    }

    #[tokio::test]
    async fn test_lease_request_times_out_without_connections() {
        let cluster = FakeCluster::new();
        cluster.refuse_connections(true);
        let tasks = TaskSet::new();
        let mut config = config(&["impala-1"], 1);
        config.lease_timeout_ms = 30;
        let pool = PoolHandle::start(
            &config,
            Arc::new(FakeConnector::new(cluster.clone())),
            &tasks,
        )
        .unwrap();

        let err = pool.request_lease("impatient").await.unwrap_err();
        assert!(matches!(err, ImpalaError::Timeout(_)));

        // The abandoned request is skipped once a connection shows up
        cluster.refuse_connections(false);
        wait_for_registered(&pool, 1).await;
        let status = pool.status().await.unwrap();
        assert_eq!(status.pending, 0);
        assert_eq!(status.idle, 1);
        tasks.abort_all();
    }
}
