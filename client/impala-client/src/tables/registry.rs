//! Table registry task
//!
//! Maps each row type to its schema and table coordinator. A type's schema
//! is resolved and its coordinator spawned the first time the type is seen;
//! later lookups reuse both.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use impala_common::{CodecRegistry, Entity, EntitySchema, ImpalaError, ImpalaResult};

use super::coordinator::{TableCoordinator, TableHandle, TableSettings};
use crate::mailbox::{ask, Reply};
use crate::pool::PoolHandle;
use crate::tasks::TaskSet;

/// Identity of a row type plus the function producing its schema
#[derive(Clone, Copy)]
pub(crate) struct TableRegistration {
    pub type_id: TypeId,
    pub type_name: &'static str,
    pub schema: fn() -> ImpalaResult<EntitySchema>,
}

impl TableRegistration {
    pub(crate) fn of<T: Entity>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            schema: T::schema,
        }
    }
}

/// Resolved schema and coordinator of one row type
#[derive(Debug, Clone)]
pub struct TableEntry {
    pub schema: Arc<EntitySchema>,
    pub table: TableHandle,
}

pub(crate) enum RegistryMessage {
    Resolve {
        registration: TableRegistration,
        reply: Reply<TableEntry>,
    },
    Tables(oneshot::Sender<Vec<String>>),
}

#[derive(Clone)]
pub(crate) struct RegistryHandle {
    tx: mpsc::UnboundedSender<RegistryMessage>,
    request_timeout: Duration,
}

impl RegistryHandle {
    pub(crate) async fn resolve(&self, registration: TableRegistration) -> ImpalaResult<TableEntry> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryMessage::Resolve {
                registration,
                reply,
            })
            .map_err(|_| ImpalaError::Shutdown("table registry is gone".to_string()))?;
        ask(rx, self.request_timeout, "table resolution").await
    }

    /// Qualified names of every table resolved so far
    pub(crate) async fn tables(&self) -> ImpalaResult<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryMessage::Tables(reply))
            .map_err(|_| ImpalaError::Shutdown("table registry is gone".to_string()))?;
        rx.await
            .map_err(|_| ImpalaError::Shutdown("table registry is gone".to_string()))
    }
}

pub(crate) struct TableRegistry {
    inbox: mpsc::UnboundedReceiver<RegistryMessage>,
    entries: HashMap<TypeId, TableEntry>,
    pool: PoolHandle,
    codecs: Arc<CodecRegistry>,
    settings: TableSettings,
    tasks: TaskSet,
}

impl TableRegistry {
    pub(crate) fn new(
        pool: PoolHandle,
        codecs: Arc<CodecRegistry>,
        settings: TableSettings,
        tasks: TaskSet,
    ) -> (Self, RegistryHandle) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let handle = RegistryHandle {
            tx,
            request_timeout: settings.request_timeout,
        };
        let registry = Self {
            inbox,
            entries: HashMap::new(),
            pool,
            codecs,
            settings,
            tasks,
        };
        (registry, handle)
    }

    pub(crate) async fn run(mut self) {
        while let Some(message) = self.inbox.recv().await {
            match message {
                RegistryMessage::Resolve {
                    registration,
                    reply,
                } => {
                    let _ = reply.send(self.resolve(registration));
                }
                RegistryMessage::Tables(reply) => {
                    let mut tables: Vec<String> = self
                        .entries
                        .values()
                        .map(|entry| entry.table.table().to_string())
                        .collect();
                    tables.sort();
                    let _ = reply.send(tables);
                }
            }
        }
        debug!("Table registry inbox closed");
    }

    fn resolve(&mut self, registration: TableRegistration) -> ImpalaResult<TableEntry> {
        if let Some(entry) = self.entries.get(&registration.type_id) {
            return Ok(entry.clone());
        }

        let schema = (registration.schema)().map_err(|e| {
            warn!(row_type = registration.type_name, error = %e, "Row type has no usable schema");
            e
        })?;
        let schema = Arc::new(schema);

        let (coordinator, table) = TableCoordinator::new(
            Arc::clone(&schema),
            Arc::clone(&self.codecs),
            self.pool.clone(),
            self.settings.clone(),
            self.tasks.clone(),
        );
        self.tasks.spawn(coordinator.run());
        info!(row_type = registration.type_name, table = %table.table(), "Registered table coordinator");

        let entry = TableEntry { schema, table };
        self.entries.insert(registration.type_id, entry.clone());
        Ok(entry)
    }
}
