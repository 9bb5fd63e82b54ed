//! Bulk insert workers
//!
//! A worker takes one batch at a time through
//! `ResolvingTable -> ResolvingPartitions -> CreatingPartitions ->
//! AcquiringConnection -> Inserting` and replies exactly once per batch.
//! Range partition steps are skipped for tables without range partitioning.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use impala_common::ddl;
use impala_common::{CodecRegistry, ImpalaError, ImpalaResult, InsertResult, Value};

use crate::mailbox::Reply;
use crate::pool::PoolHandle;
use crate::tables::{RegistryHandle, TableEntry, TableRegistration};

/// Stage of the batch a worker is processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsertStage {
    Idle,
    ResolvingTable,
    ResolvingPartitions,
    CreatingPartitions,
    AcquiringConnection,
    Inserting,
}

impl fmt::Display for InsertStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub(crate) struct InsertRequest {
    pub registration: TableRegistration,
    pub rows: Vec<Vec<Value>>,
    pub upsert: bool,
    pub reply: Reply<InsertResult>,
}

pub(crate) struct BulkInsertCoordinator {
    id: usize,
    holder: String,
    inbox: mpsc::UnboundedReceiver<InsertRequest>,
    load: Arc<AtomicUsize>,
    registry: RegistryHandle,
    pool: PoolHandle,
    codecs: Arc<CodecRegistry>,
    default_database: String,
    stage: InsertStage,
}

impl BulkInsertCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        holder: String,
        inbox: mpsc::UnboundedReceiver<InsertRequest>,
        load: Arc<AtomicUsize>,
        registry: RegistryHandle,
        pool: PoolHandle,
        codecs: Arc<CodecRegistry>,
        default_database: String,
    ) -> Self {
        Self {
            id,
            holder,
            inbox,
            load,
            registry,
            pool,
            codecs,
            default_database,
            stage: InsertStage::Idle,
        }
    }

    #[instrument(skip(self), fields(worker = self.id))]
    pub(crate) async fn run(mut self) {
        while let Some(request) = self.inbox.recv().await {
            let InsertRequest {
                registration,
                rows,
                upsert,
                reply,
            } = request;

            let result = self.process(registration, rows, upsert).await;
            if let Err(e) = &result {
                warn!(row_type = registration.type_name, stage = %self.stage, error = %e, "Bulk insert failed");
            }
            self.enter(InsertStage::Idle);
            let _ = reply.send(result);
            self.load.fetch_sub(1, Ordering::SeqCst);
        }
        debug!("Bulk insert inbox closed");
    }

    fn enter(&mut self, stage: InsertStage) {
        debug!(from = %self.stage, to = %stage, "Insert stage");
        self.stage = stage;
    }

    async fn process(
        &mut self,
        registration: TableRegistration,
        rows: Vec<Vec<Value>>,
        upsert: bool,
    ) -> ImpalaResult<InsertResult> {
        self.enter(InsertStage::ResolvingTable);
        let entry = self.registry.resolve(registration).await?;
        for row in &rows {
            entry.schema.check_row(row)?;
        }

        if entry.schema.range_partition.is_some() {
            self.ensure_partitions(&entry, &rows).await?;
        }

        let table = entry.schema.qualified_name(&self.default_database);
        let statement =
            ddl::insert_statement(&entry.schema, &table, &rows, &self.codecs, upsert)?;

        self.enter(InsertStage::AcquiringConnection);
        let lease = self.pool.request_lease(&self.holder).await?;

        self.enter(InsertStage::Inserting);
        let result = lease.insert(&statement).await;
        lease.release();

        let result = result?;
        info!(
            table = %table,
            rows = rows.len(),
            rows_modified = result.rows_modified,
            upsert,
            "Inserted batch"
        );
        Ok(result)
    }

    /// Make sure every row's partition key falls inside a range partition
    async fn ensure_partitions(&mut self, entry: &TableEntry, rows: &[Vec<Value>]) -> ImpalaResult<()> {
        self.enter(InsertStage::ResolvingPartitions);
        let Some(range) = entry.schema.range_partition.as_ref() else {
            return Ok(());
        };
        let index = entry.schema.column_index(&range.column).ok_or_else(|| {
            ImpalaError::Schema(format!(
                "range partition column {} not found in table {}",
                range.column, entry.schema.table
            ))
        })?;

        let keys = rows
            .iter()
            .map(|row| {
                row.get(index)
                    .ok_or_else(|| {
                        ImpalaError::Schema(format!("row has no value for {}", range.column))
                    })
                    .and_then(Value::partition_key)
            })
            .collect::<ImpalaResult<Vec<_>>>()?;

        let partitions = entry.table.partition_information().await?;
        let missing = partitions.missing_partitions(keys, range.bucket_size())?;
        if missing.is_empty() {
            return Ok(());
        }

        self.enter(InsertStage::CreatingPartitions);
        debug!(table = %entry.table.table(), missing = missing.len(), "Requesting range partitions");
        entry.table.add_range_partitions(missing).await?.into_result()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolHandle;
    use crate::tables::{TableRegistry, TableSettings};
    use crate::tasks::TaskSet;
    use crate::test_utilities::{FakeCluster, FakeConnector};
    use chrono::{TimeZone, Utc};
    use impala_common::{ClientConfig, Entity, EntitySchema, SemanticType, MILLIS_PER_DAY};
    use std::time::Duration;
    use tokio::sync::oneshot;

    struct Reading {
        id: i64,
        at: chrono::DateTime<Utc>,
    }

    impl Entity for Reading {
        fn schema() -> ImpalaResult<EntitySchema> {
            EntitySchema::builder("readings")
                .kudu(true)
                .column("id", SemanticType::Int64)
                .column("at", SemanticType::Timestamp)
                .primary_key(["id", "at"])
                .range_partition("at", 1)
                .build()
        }

        fn values(&self) -> Vec<Value> {
            vec![self.id.into(), self.at.into()]
        }
    }

    struct Worker {
        cluster: FakeCluster,
        tx: mpsc::UnboundedSender<InsertRequest>,
        load: Arc<AtomicUsize>,
        tasks: TaskSet,
    }

    fn start() -> Worker {
        let cluster = FakeCluster::new();
        let tasks = TaskSet::new();
        let config = ClientConfig {
            hosts: vec!["impala-1".to_string()],
            connections_per_host: 1,
            fetch_poll_interval_ms: 1,
            ..ClientConfig::default()
        };
        let pool = PoolHandle::start(
            &config,
            Arc::new(FakeConnector::new(cluster.clone())),
            &tasks,
        )
        .unwrap();
        let codecs = Arc::new(CodecRegistry::with_defaults());
        let settings = TableSettings {
            default_database: "default".to_string(),
            replication_factor: None,
            check_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            holder: "tables".to_string(),
        };
        let (registry, registry_handle) =
            TableRegistry::new(pool.clone(), Arc::clone(&codecs), settings, tasks.clone());
        tasks.spawn(registry.run());

        let (tx, inbox) = mpsc::unbounded_channel();
        let load = Arc::new(AtomicUsize::new(0));
        let worker = BulkInsertCoordinator::new(
            0,
            "insert-0".to_string(),
            inbox,
            Arc::clone(&load),
            registry_handle,
            pool,
            codecs,
            "default".to_string(),
        );
        tasks.spawn(worker.run());
        Worker {
            cluster,
            tx,
            load,
            tasks,
        }
    }

    async fn send(worker: &Worker, rows: &[Reading]) -> ImpalaResult<InsertResult> {
        let (reply, rx) = oneshot::channel();
        worker.load.fetch_add(1, Ordering::SeqCst);
        worker
            .tx
            .send(InsertRequest {
                registration: TableRegistration::of::<Reading>(),
                rows: rows.iter().map(|row| row.values()).collect(),
                upsert: false,
                reply,
            })
            .unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_creates_missing_partitions_first() {
        let worker = start();
        let day = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let rows = vec![
            Reading { id: 1, at: day },
            Reading { id: 2, at: day + chrono::Duration::hours(1) },
        ];

        let result = send(&worker, &rows).await.unwrap();
        assert_eq!(result.rows_modified, 2);
        assert_eq!(worker.load.load(Ordering::SeqCst), 0);

        let start = day.timestamp_millis().div_euclid(MILLIS_PER_DAY) * MILLIS_PER_DAY;
        let added = worker.cluster.statements_matching("ADD RANGE PARTITION");
        assert_eq!(added.len(), 1);
        assert!(added[0].contains(&format!("{} <= VALUES < {}", start, start + MILLIS_PER_DAY)));

        // Same bucket again: nothing left to create
        send(&worker, &[Reading { id: 3, at: day }]).await.unwrap();
        assert_eq!(worker.cluster.statements_matching("ADD RANGE PARTITION").len(), 1);
        worker.tasks.abort_all();
    }

    #[tokio::test]
    async fn test_short_row_is_rejected_before_any_statement() {
        let worker = start();
        let (reply, rx) = oneshot::channel();
        worker.load.fetch_add(1, Ordering::SeqCst);
        worker
            .tx
            .send(InsertRequest {
                registration: TableRegistration::of::<Reading>(),
                rows: vec![vec![Value::Int64(1)]],
                upsert: false,
                reply,
            })
            .unwrap();

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, ImpalaError::Schema(_)));
        assert!(worker.cluster.statements_matching("insert into").is_empty());
        assert_eq!(worker.load.load(Ordering::SeqCst), 0);
        worker.tasks.abort_all();
    }

    #[tokio::test]
    async fn test_server_rejection_is_returned() {
        let worker = start();
        worker.cluster.fail_statements_matching(
            "insert into",
            ImpalaError::Server("Memory limit exceeded".into()),
        );
        let rows = vec![Reading {
            id: 7,
            at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }];
        let err = send(&worker, &rows).await.unwrap_err();
        assert_eq!(err, ImpalaError::Server("Memory limit exceeded".into()));
        worker.tasks.abort_all();
    }
}
