//! Public client facade
//!
//! `ImpalaClient::start` spawns the whole runtime on the current tokio
//! runtime: one task per pooled connection, the pool, the table registry,
//! and fixed sets of insert and query workers. Every call the facade makes
//! is a bounded wait for a worker's reply.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, instrument};

use impala_common::{
    ClientConfig, CodecRegistry, Entity, FieldSpec, FromRecord, ImpalaError, ImpalaResult,
    InsertResult, PartitionSet, RangePartition, Record, ServiceConnector,
};

use crate::bulk::{BulkInsertCoordinator, InsertRequest};
use crate::mailbox::ask;
use crate::pool::{PoolHandle, PoolStatus};
use crate::query::{QueryCoordinator, QueryRequest};
use crate::router::WorkerRouter;
use crate::tables::{RegistryHandle, TableEntry, TableRegistration, TableRegistry, TableSettings};
use crate::tasks::TaskSet;

/// Handle to a running client
pub struct ImpalaClient {
    config: ClientConfig,
    pool: PoolHandle,
    registry: RegistryHandle,
    inserts: WorkerRouter<InsertRequest>,
    queries: WorkerRouter<QueryRequest>,
    request_timeout: Duration,
    tasks: TaskSet,
}

impl ImpalaClient {
    /// Start with the built-in codecs
    pub fn start(config: ClientConfig, connector: Arc<dyn ServiceConnector>) -> ImpalaResult<Self> {
        Self::start_with_codecs(config, connector, CodecRegistry::with_defaults())
    }

    /// Start with a caller-supplied codec registry
    pub fn start_with_codecs(
        config: ClientConfig,
        connector: Arc<dyn ServiceConnector>,
        codecs: CodecRegistry,
    ) -> ImpalaResult<Self> {
        config.validate()?;

        let tasks = TaskSet::new();
        let codecs = Arc::new(codecs);
        let pool = PoolHandle::start(&config, connector, &tasks)?;

        let settings = TableSettings {
            default_database: config.default_database.clone(),
            replication_factor: config.replication_factor,
            check_backoff: config.table_check_backoff(),
            request_timeout: config.request_timeout(),
            holder: format!("{}/tables", config.instance_id),
        };
        let (registry, registry_handle) =
            TableRegistry::new(pool.clone(), Arc::clone(&codecs), settings, tasks.clone());
        tasks.spawn(registry.run());

        let mut inserts = WorkerRouter::new("insert");
        for id in 0..config.insert_workers {
            let (inbox, load) = inserts.add_worker();
            let worker = BulkInsertCoordinator::new(
                id,
                format!("{}/insert-{}", config.instance_id, id),
                inbox,
                load,
                registry_handle.clone(),
                pool.clone(),
                Arc::clone(&codecs),
                config.default_database.clone(),
            );
            tasks.spawn(worker.run());
        }

        let mut queries = WorkerRouter::new("query");
        for id in 0..config.query_workers {
            let (inbox, load) = queries.add_worker();
            let worker = QueryCoordinator::new(
                id,
                format!("{}/query-{}", config.instance_id, id),
                inbox,
                load,
                pool.clone(),
                Arc::clone(&codecs),
            );
            tasks.spawn(worker.run());
        }

        info!(
            instance_id = %config.instance_id,
            hosts = config.hosts.len(),
            insert_workers = config.insert_workers,
            query_workers = config.query_workers,
            "Impala client started"
        );

        Ok(Self {
            request_timeout: config.request_timeout(),
            config,
            pool,
            registry: registry_handle,
            inserts,
            queries,
            tasks,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &PoolHandle {
        &self.pool
    }

    /// Insert a batch of rows of one type
    pub async fn insert<T: Entity>(&self, rows: &[T]) -> ImpalaResult<InsertResult> {
        self.write(rows, false).await
    }

    /// Insert or replace a batch of rows of one type
    pub async fn upsert<T: Entity>(&self, rows: &[T]) -> ImpalaResult<InsertResult> {
        self.write(rows, true).await
    }

    #[instrument(skip(self, rows), fields(row_type = std::any::type_name::<T>(), batch_rows = rows.len()))]
    async fn write<T: Entity>(&self, rows: &[T], upsert: bool) -> ImpalaResult<InsertResult> {
        if rows.is_empty() {
            return Err(ImpalaError::InvalidRequest(
                "insert needs at least one row".to_string(),
            ));
        }
        let (reply, rx) = oneshot::channel();
        self.inserts.route(InsertRequest {
            registration: TableRegistration::of::<T>(),
            rows: rows.iter().map(Entity::values).collect(),
            upsert,
            reply,
        })?;
        ask(rx, self.request_timeout, "insert request").await
    }

    /// Run a query and decode every row into `T`
    pub async fn query<T: FromRecord>(&self, statement: &str) -> ImpalaResult<Vec<T>> {
        self.query_records(statement, T::fields())
            .await?
            .iter()
            .map(T::from_record)
            .collect()
    }

    /// Run a query and decode every row into a record holding `fields`
    #[instrument(skip(self, fields))]
    pub async fn query_records(
        &self,
        statement: &str,
        fields: Vec<FieldSpec>,
    ) -> ImpalaResult<Vec<Record>> {
        let (reply, rx) = oneshot::channel();
        self.queries.route(QueryRequest {
            statement: statement.to_string(),
            fields,
            reply,
        })?;
        ask(rx, self.request_timeout, "query request").await
    }

    /// Schema and table coordinator for `T`, resolving them on first use
    pub async fn table<T: Entity>(&self) -> ImpalaResult<TableEntry> {
        self.registry.resolve(TableRegistration::of::<T>()).await
    }

    /// Current partitioning of `T`'s table
    pub async fn partitions<T: Entity>(&self) -> ImpalaResult<PartitionSet> {
        self.table::<T>().await?.table.partition_information().await
    }

    /// Drop range partitions of `T`'s table that fell out of its TTL
    pub async fn drop_expired_partitions<T: Entity>(&self) -> ImpalaResult<Vec<RangePartition>> {
        self.table::<T>()
            .await?
            .table
            .drop_expired_partitions(Utc::now())
            .await
    }

    /// Qualified names of tables resolved so far
    pub async fn tables(&self) -> ImpalaResult<Vec<String>> {
        self.registry.tables().await
    }

    pub async fn pool_status(&self) -> ImpalaResult<PoolStatus> {
        self.pool.status().await
    }

    /// Requests in flight per insert worker
    pub fn insert_loads(&self) -> Vec<usize> {
        self.inserts.loads()
    }

    pub fn query_loads(&self) -> Vec<usize> {
        self.queries.loads()
    }

    /// Abort every task; outstanding calls fail with `Shutdown` or `Timeout`
    pub fn shutdown(&self) {
        info!(instance_id = %self.config.instance_id, "Shutting down Impala client");
        self.tasks.abort_all();
    }
}

impl Drop for ImpalaClient {
    fn drop(&mut self) {
        self.tasks.abort_all();
    }
}
