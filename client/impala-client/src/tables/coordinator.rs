//! Per-table coordinator
//!
//! One task per row type. It starts in `CheckingExistence`: lease a
//! connection, switch to the table's database, list tables and create the
//! table when it is missing. Any failure there is retried after the table
//! check backoff, forever; requests that arrive meanwhile are deferred and
//! served in arrival order once the table is `Ready`.
//!
//! From `Ready` the coordinator answers partition information requests,
//! adds range partitions and drops expired ones. Each request runs to
//! completion before the next is taken, so concurrent bootstrap requests for
//! one table are serialized here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use impala_common::ddl;
use impala_common::{
    CodecRegistry, EntitySchema, ImpalaError, ImpalaResult, PartitionSet, RangePartition,
};

use crate::mailbox::{ask, Deferred, Reply};
use crate::pool::{ConnectionLease, PoolHandle};
use crate::tasks::TaskSet;

/// Coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableState {
    CheckingExistence,
    Ready,
    RetrievingPartitions,
    CreatingPartitions,
    DroppingPartitions,
}

/// Result of one batch of `ADD RANGE PARTITION` statements
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddRangeOutcome {
    pub created: Vec<RangePartition>,
    /// Ranges another request created first
    pub already_present: Vec<RangePartition>,
    pub failures: Vec<(RangePartition, ImpalaError)>,
}

impl AddRangeOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Fail with the recorded server errors, if any
    pub fn into_result(self) -> ImpalaResult<Self> {
        if self.failures.is_empty() {
            return Ok(self);
        }
        let details = self
            .failures
            .iter()
            .map(|(range, e)| format!("[{}]: {}", range, e))
            .collect::<Vec<_>>()
            .join("; ");
        Err(ImpalaError::Server(format!(
            "failed to add {} range partitions: {}",
            self.failures.len(),
            details
        )))
    }
}

pub(crate) enum TableMessage {
    CheckExistence,
    PartitionInformation(Reply<PartitionSet>),
    AddRangePartitions {
        ranges: Vec<RangePartition>,
        reply: Reply<AddRangeOutcome>,
    },
    DropExpiredPartitions {
        now: DateTime<Utc>,
        reply: Reply<Vec<RangePartition>>,
    },
    State(oneshot::Sender<TableState>),
}

/// Settings shared by every table coordinator of a client
#[derive(Debug, Clone)]
pub(crate) struct TableSettings {
    pub default_database: String,
    pub replication_factor: Option<u32>,
    pub check_backoff: Duration,
    pub request_timeout: Duration,
    pub holder: String,
}

/// Address of a table coordinator
#[derive(Clone)]
pub struct TableHandle {
    table: String,
    tx: mpsc::UnboundedSender<TableMessage>,
    request_timeout: Duration,
}

impl TableHandle {
    /// `database.table` this coordinator manages
    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn partition_information(&self) -> ImpalaResult<PartitionSet> {
        let (reply, rx) = oneshot::channel();
        self.send(TableMessage::PartitionInformation(reply))?;
        ask(rx, self.request_timeout, "partition information request").await
    }

    pub async fn add_range_partitions(
        &self,
        ranges: Vec<RangePartition>,
    ) -> ImpalaResult<AddRangeOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(TableMessage::AddRangePartitions { ranges, reply })?;
        ask(rx, self.request_timeout, "add range partitions request").await
    }

    /// Drop range partitions that ended more than the table's TTL before `now`
    pub async fn drop_expired_partitions(
        &self,
        now: DateTime<Utc>,
    ) -> ImpalaResult<Vec<RangePartition>> {
        let (reply, rx) = oneshot::channel();
        self.send(TableMessage::DropExpiredPartitions { now, reply })?;
        ask(rx, self.request_timeout, "drop expired partitions request").await
    }

    pub async fn state(&self) -> ImpalaResult<TableState> {
        let (reply, rx) = oneshot::channel();
        self.send(TableMessage::State(reply))?;
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(_)) => Err(ImpalaError::Shutdown(format!(
                "table coordinator for {} is gone",
                self.table
            ))),
            Err(_) => Err(ImpalaError::Timeout(format!(
                "table coordinator for {} did not report its state",
                self.table
            ))),
        }
    }

    fn send(&self, message: TableMessage) -> ImpalaResult<()> {
        self.tx.send(message).map_err(|_| {
            ImpalaError::Shutdown(format!("table coordinator for {} is gone", self.table))
        })
    }
}

impl fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableHandle")
            .field("table", &self.table)
            .finish()
    }
}

pub(crate) struct TableCoordinator {
    schema: Arc<EntitySchema>,
    database: String,
    qualified: String,
    codecs: Arc<CodecRegistry>,
    pool: PoolHandle,
    settings: TableSettings,
    tx: mpsc::UnboundedSender<TableMessage>,
    inbox: mpsc::UnboundedReceiver<TableMessage>,
    deferred: Deferred<TableMessage>,
    state: TableState,
    tasks: TaskSet,
}

impl TableCoordinator {
    pub(crate) fn new(
        schema: Arc<EntitySchema>,
        codecs: Arc<CodecRegistry>,
        pool: PoolHandle,
        settings: TableSettings,
        tasks: TaskSet,
    ) -> (Self, TableHandle) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let database = schema.database_or(&settings.default_database).to_string();
        let qualified = schema.qualified_name(&settings.default_database);
        let handle = TableHandle {
            table: qualified.clone(),
            tx: tx.clone(),
            request_timeout: settings.request_timeout,
        };
        let coordinator = Self {
            schema,
            database,
            qualified,
            codecs,
            pool,
            settings,
            tx,
            inbox,
            deferred: Deferred::new(),
            state: TableState::CheckingExistence,
            tasks,
        };
        (coordinator, handle)
    }

    #[instrument(skip(self), fields(table = %self.qualified))]
    pub(crate) async fn run(mut self) {
        self.check_existence().await;
        while let Some(message) = self.inbox.recv().await {
            self.handle_message(message).await;
        }
        debug!("Table coordinator inbox closed");
    }

    async fn handle_message(&mut self, message: TableMessage) {
        match message {
            TableMessage::State(reply) => {
                let _ = reply.send(self.state);
            }
            TableMessage::CheckExistence => {
                if self.state == TableState::CheckingExistence {
                    self.check_existence().await;
                }
            }
            other if self.state == TableState::CheckingExistence => {
                self.deferred.defer(other);
                debug!(deferred = self.deferred.len(), "Table not ready, deferring request");
            }
            other => self.serve(other).await,
        }
    }

    async fn check_existence(&mut self) {
        match self.ensure_table().await {
            Ok(created) => {
                if created {
                    info!("Created table");
                } else {
                    debug!("Table already exists");
                }
                self.state = TableState::Ready;
                for message in self.deferred.drain() {
                    self.serve(message).await;
                }
            }
            Err(e) => {
                let backoff = self.settings.check_backoff;
                warn!(error = %e, retry_in = ?backoff, "Table existence check failed, will retry");
                let tx = self.tx.clone();
                self.tasks.spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let _ = tx.send(TableMessage::CheckExistence);
                });
            }
        }
    }

    /// Create the table when it is missing; the existing definition is not compared
    async fn ensure_table(&self) -> ImpalaResult<bool> {
        let lease = self.pool.request_lease(&self.settings.holder).await?;
        lease.query(&ddl::use_database(&self.database)).await?;
        let tables = lease.query(&ddl::show_tables()).await?;
        let exists = tables
            .first_column()
            .iter()
            .any(|name| name.eq_ignore_ascii_case(&self.schema.table));

        if !exists {
            let statement =
                ddl::create_table(&self.schema, &self.codecs, self.settings.replication_factor)?;
            lease.query(&statement).await?;
        }
        lease.release();
        Ok(!exists)
    }

    async fn serve(&mut self, message: TableMessage) {
        match message {
            TableMessage::PartitionInformation(reply) => {
                self.state = TableState::RetrievingPartitions;
                let result = self.retrieve_partitions().await;
                self.state = TableState::Ready;
                let _ = reply.send(result);
            }
            TableMessage::AddRangePartitions { ranges, reply } => {
                self.state = TableState::CreatingPartitions;
                let result = self.create_partitions(ranges).await;
                self.state = TableState::Ready;
                let _ = reply.send(result);
            }
            TableMessage::DropExpiredPartitions { now, reply } => {
                self.state = TableState::DroppingPartitions;
                let result = self.drop_expired(now).await;
                self.state = TableState::Ready;
                let _ = reply.send(result);
            }
            TableMessage::State(reply) => {
                let _ = reply.send(self.state);
            }
            TableMessage::CheckExistence => {}
        }
    }

    async fn retrieve_partitions(&self) -> ImpalaResult<PartitionSet> {
        let lease = self.pool.request_lease(&self.settings.holder).await?;
        let partitions = self.read_partitions(&lease).await?;
        lease.release();
        debug!(ranges = partitions.len(), "Retrieved partition information");
        Ok(partitions)
    }

    async fn read_partitions(&self, lease: &ConnectionLease) -> ImpalaResult<PartitionSet> {
        let definition = lease
            .query(&ddl::show_create_table(&self.qualified))
            .await?;
        let definition = definition.rows.join("\n");

        let ranges = if self.schema.range_partition.is_some() {
            lease
                .query(&ddl::show_range_partitions(&self.qualified))
                .await?
                .first_column()
        } else {
            Vec::new()
        };

        PartitionSet::parse(&definition, &ranges)
    }

    async fn create_partitions(&self, ranges: Vec<RangePartition>) -> ImpalaResult<AddRangeOutcome> {
        let mut outcome = AddRangeOutcome::default();
        if ranges.is_empty() {
            return Ok(outcome);
        }

        let lease = self.pool.request_lease(&self.settings.holder).await?;
        for range in ranges {
            match lease
                .query(&ddl::add_range_partition(&self.qualified, &range))
                .await
            {
                Ok(_) => {
                    debug!(range = %range, "Added range partition");
                    outcome.created.push(range);
                }
                Err(e) if e.is_partition_race() => {
                    debug!(range = %range, "Range partition already present");
                    outcome.already_present.push(range);
                }
                Err(ImpalaError::Server(message)) => {
                    warn!(range = %range, error = %message, "Failed to add range partition");
                    outcome.failures.push((range, ImpalaError::Server(message)));
                }
                Err(e) => return Err(e),
            }
        }
        lease.release();

        info!(
            created = outcome.created.len(),
            already_present = outcome.already_present.len(),
            failed = outcome.failures.len(),
            "Range partition bootstrap finished"
        );
        Ok(outcome)
    }

    async fn drop_expired(&self, now: DateTime<Utc>) -> ImpalaResult<Vec<RangePartition>> {
        let ttl = self
            .schema
            .range_partition
            .as_ref()
            .and_then(|range| range.ttl_millis())
            .ok_or_else(|| {
                ImpalaError::InvalidRequest(format!("table {} declares no ttl", self.qualified))
            })?;
        let cutoff = now.timestamp_millis().saturating_sub(ttl);

        let lease = self.pool.request_lease(&self.settings.holder).await?;
        let partitions = self.read_partitions(&lease).await?;

        let mut dropped = Vec::new();
        let mut failures = Vec::new();
        for range in partitions.expired(cutoff) {
            match lease
                .query(&ddl::drop_range_partition(&self.qualified, &range))
                .await
            {
                Ok(_) => dropped.push(range),
                Err(ImpalaError::Server(message)) => failures.push(format!("[{}]: {}", range, message)),
                Err(e) => return Err(e),
            }
        }
        lease.release();

        if !failures.is_empty() {
            return Err(ImpalaError::Server(format!(
                "failed to drop {} range partitions: {}",
                failures.len(),
                failures.join("; ")
            )));
        }
        info!(dropped = dropped.len(), cutoff, "Dropped expired range partitions");
        Ok(dropped)
    }
}
