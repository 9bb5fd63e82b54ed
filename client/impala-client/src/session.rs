//! Statement execution over one RPC connection
//!
//! A statement runs as `query` followed by `fetch` polling until the engine
//! reports no more rows, then `close`. Inserts skip the close, read the
//! engine log and finish with `close_insert`; any row error fails the insert.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use impala_common::ddl;
use impala_common::{
    ImpalaError, ImpalaResult, ImpalaService, InsertResult, QueryHandle, QueryResponse,
};

/// One open connection plus its polling policy
pub struct Session {
    service: Box<dyn ImpalaService>,
    poll_interval: Duration,
    statement_timeout: Duration,
}

impl Session {
    pub fn new(
        service: Box<dyn ImpalaService>,
        poll_interval: Duration,
        statement_timeout: Duration,
    ) -> Self {
        Self {
            service,
            poll_interval,
            statement_timeout,
        }
    }

    /// Health probe run before a connection registers
    pub async fn probe(&mut self) -> ImpalaResult<()> {
        self.query(&ddl::show_databases()).await.map(|_| ())
    }

    /// Execute a statement and collect its rows
    pub async fn query(&mut self, statement: &str) -> ImpalaResult<QueryResponse> {
        let handle = self.service.query(statement).await?;
        match self.collect(&handle).await {
            Ok(response) => {
                self.service.close(&handle).await?;
                Ok(response)
            }
            Err(e) => Err(self.abandon(&handle, e).await),
        }
    }

    /// Execute an insert and check its row errors
    pub async fn insert(&mut self, statement: &str) -> ImpalaResult<InsertResult> {
        let handle = self.service.query(statement).await?;
        if let Err(e) = self.collect(&handle).await {
            return Err(self.abandon(&handle, e).await);
        }

        let log = match self.service.get_log(&handle).await {
            Ok(log) => log,
            Err(e) => return Err(self.abandon(&handle, e).await),
        };
        let result = match self.service.close_insert(&handle).await {
            Ok(result) => result,
            Err(e) => return Err(self.abandon(&handle, e).await),
        };
        if result.row_errors > 0 {
            warn!(
                row_errors = result.row_errors,
                rows_modified = result.rows_modified,
                "Insert reported row errors"
            );
            return Err(ImpalaError::Server(format!(
                "insert finished with {} row errors: {}",
                result.row_errors, log
            )));
        }
        Ok(result)
    }

    async fn collect(&mut self, handle: &QueryHandle) -> ImpalaResult<QueryResponse> {
        let deadline = Instant::now() + self.statement_timeout;
        let mut response = QueryResponse::default();
        let mut first = true;

        loop {
            if Instant::now() >= deadline {
                return Err(ImpalaError::Timeout(format!(
                    "statement {} did not finish within {:?}",
                    handle.id, self.statement_timeout
                )));
            }

            let batch = self.service.fetch(handle).await?;
            if batch.ready {
                if first {
                    response.column_types = batch.columns;
                    first = false;
                }
                response.rows.extend(batch.rows);
                if !batch.has_more {
                    break;
                }
                continue;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        response.metadata = self.service.get_results_metadata(handle).await?;
        debug!(handle = %handle.id, rows = response.rows.len(), "Statement finished");
        Ok(response)
    }

    /// Close a handle after a failed step, keeping the original error
    async fn abandon(&mut self, handle: &QueryHandle, error: ImpalaError) -> ImpalaError {
        if error.is_transport() {
            return error;
        }
        if let Err(close_error) = self.service.close(handle).await {
            debug!(handle = %handle.id, error = %close_error, "Failed to close abandoned handle");
            if close_error.is_transport() {
                return close_error;
            }
        }
        error
    }
}
