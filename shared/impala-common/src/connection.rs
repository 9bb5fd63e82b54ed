//! RPC collaborator seams
//!
//! The wire protocol is not implemented here. A transport crate provides an
//! [`ImpalaService`] for one open connection and a [`ServiceConnector`] that
//! opens such connections; the client only ever talks to these traits.
//!
//! Implementations must report socket-level failures as
//! [`ImpalaError::Transport`](crate::ImpalaError::Transport) and statement
//! rejections as [`ImpalaError::Server`](crate::ImpalaError::Server). The
//! client recycles the connection only on the former.

use async_trait::async_trait;

use crate::config::HostAddr;
use crate::error::ImpalaResult;
use crate::types::{FetchResult, InsertResult, QueryHandle, ResultsMetadata};

/// One open connection to an engine daemon
#[async_trait]
pub trait ImpalaService: Send {
    /// Submit a statement
    async fn query(&mut self, statement: &str) -> ImpalaResult<QueryHandle>;

    /// Poll for the next batch of rows
    async fn fetch(&mut self, handle: &QueryHandle) -> ImpalaResult<FetchResult>;

    async fn get_results_metadata(&mut self, handle: &QueryHandle) -> ImpalaResult<ResultsMetadata>;

    /// Finish an insert and read its summary
    async fn close_insert(&mut self, handle: &QueryHandle) -> ImpalaResult<InsertResult>;

    async fn close(&mut self, handle: &QueryHandle) -> ImpalaResult<()>;

    async fn get_log(&mut self, handle: &QueryHandle) -> ImpalaResult<String>;
}

/// Opens [`ImpalaService`] connections
#[async_trait]
pub trait ServiceConnector: Send + Sync + 'static {
    async fn connect(&self, host: &HostAddr) -> ImpalaResult<Box<dyn ImpalaService>>;
}
