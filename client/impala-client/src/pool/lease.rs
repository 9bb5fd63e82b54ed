//! Exclusive use of one pooled connection

use std::fmt;
use uuid::Uuid;

use impala_common::{ImpalaResult, InsertResult, QueryResponse};

use super::connection::ConnectionHandle;
use super::ConnectionId;

/// A grant of one connection to one holder
///
/// Every statement sent through the lease carries its id; the connection
/// rejects ids that are not its current lease. Dropping an unreleased lease
/// releases it.
pub struct ConnectionLease {
    connection: ConnectionHandle,
    lease_id: Uuid,
    holder: String,
    released: bool,
}

impl ConnectionLease {
    pub(crate) fn new(connection: ConnectionHandle, lease_id: Uuid, holder: String) -> Self {
        Self {
            connection,
            lease_id,
            holder,
            released: false,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn lease_id(&self) -> Uuid {
        self.lease_id
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub async fn query(&self, statement: &str) -> ImpalaResult<QueryResponse> {
        self.connection.query(self.lease_id, statement).await
    }

    pub async fn insert(&self, statement: &str) -> ImpalaResult<InsertResult> {
        self.connection.insert(self.lease_id, statement).await
    }

    /// Hand the connection back without waiting for the acknowledgement
    pub fn release(mut self) {
        self.released = true;
        self.connection.release_detached(self.lease_id);
    }

    /// Hand the connection back and wait until it is idle again
    pub async fn release_and_wait(mut self) -> ImpalaResult<()> {
        self.released = true;
        self.connection.release(self.lease_id).await
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if !self.released {
            self.connection.release_detached(self.lease_id);
        }
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("connection_id", &self.connection.id())
            .field("lease_id", &self.lease_id)
            .field("holder", &self.holder)
            .finish()
    }
}
