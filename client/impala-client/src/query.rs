//! Query workers and result decoding

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use impala_common::{CodecRegistry, FieldSpec, ImpalaError, ImpalaResult, QueryResponse, Record};

use crate::mailbox::Reply;
use crate::pool::PoolHandle;

pub(crate) struct QueryRequest {
    pub statement: String,
    pub fields: Vec<FieldSpec>,
    pub reply: Reply<Vec<Record>>,
}

pub(crate) struct QueryCoordinator {
    id: usize,
    holder: String,
    inbox: mpsc::UnboundedReceiver<QueryRequest>,
    load: Arc<AtomicUsize>,
    pool: PoolHandle,
    codecs: Arc<CodecRegistry>,
}

impl QueryCoordinator {
    pub(crate) fn new(
        id: usize,
        holder: String,
        inbox: mpsc::UnboundedReceiver<QueryRequest>,
        load: Arc<AtomicUsize>,
        pool: PoolHandle,
        codecs: Arc<CodecRegistry>,
    ) -> Self {
        Self {
            id,
            holder,
            inbox,
            load,
            pool,
            codecs,
        }
    }

    #[instrument(skip(self), fields(worker = self.id))]
    pub(crate) async fn run(mut self) {
        while let Some(request) = self.inbox.recv().await {
            let result = self.execute(&request.statement, &request.fields).await;
            if let Err(e) = &result {
                warn!(error = %e, "Query failed");
            }
            let _ = request.reply.send(result);
            self.load.fetch_sub(1, Ordering::SeqCst);
        }
        debug!("Query inbox closed");
    }

    async fn execute(&self, statement: &str, fields: &[FieldSpec]) -> ImpalaResult<Vec<Record>> {
        let lease = self.pool.request_lease(&self.holder).await?;
        let response = lease.query(statement).await;
        lease.release();

        let response = response?;
        let records = decode_records(&response, fields, &self.codecs)?;
        debug!(rows = records.len(), "Query decoded");
        Ok(records)
    }
}

/// Decode every result row into a record holding `fields`
///
/// Columns are matched to fields by name, ignoring case. A result column
/// without a matching field, a field without a matching column, a field
/// type without a codec or a row with too few cells fails the whole result.
pub fn decode_records(
    response: &QueryResponse,
    fields: &[FieldSpec],
    codecs: &CodecRegistry,
) -> ImpalaResult<Vec<Record>> {
    let mut plan = Vec::with_capacity(fields.len());
    for field in fields {
        codecs.codec(field.ty)?;
        let index = response.column_index(&field.name).ok_or_else(|| {
            ImpalaError::Schema(format!("result has no column named {}", field.name))
        })?;
        plan.push((field, index));
    }
    if let Some(unmatched) = response
        .metadata
        .schema
        .iter()
        .find(|column| !fields.iter().any(|f| f.name.eq_ignore_ascii_case(&column.name)))
    {
        return Err(ImpalaError::Schema(format!(
            "result column {} has no matching field",
            unmatched.name
        )));
    }

    response
        .rows
        .iter()
        .enumerate()
        .map(|(row_number, row)| {
            let cells = response.cells(row);
            let mut record = Record::new();
            for (field, index) in &plan {
                let raw = cells.get(*index).ok_or_else(|| {
                    ImpalaError::Schema(format!(
                        "row {} has {} cells, column {} is missing",
                        row_number,
                        cells.len(),
                        field.name
                    ))
                })?;
                record.push(
                    field.name.clone(),
                    codecs.decode(field.ty, field.nullable, raw)?,
                );
            }
            Ok(record)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use impala_common::{FieldSchema, ResultsMetadata, SemanticType, Value};

    fn response(columns: &[&str], rows: &[&str]) -> QueryResponse {
        QueryResponse {
            metadata: ResultsMetadata {
                schema: columns
                    .iter()
                    .map(|c| FieldSchema::new(*c, "string"))
                    .collect(),
                ..ResultsMetadata::default()
            },
            column_types: columns.iter().map(|_| "string".to_string()).collect(),
            rows: rows.iter().map(|r| r.to_string()).collect(),
            insert: None,
        }
    }

    #[test]
    fn test_decode_matches_columns_by_name() {
        let response = response(&["NAME", "id"], &["alpha\t1", "NULL\t2"]);
        let fields = vec![
            FieldSpec::new("id", SemanticType::Int64),
            FieldSpec::nullable("name", SemanticType::String),
        ];
        let records = decode_records(&response, &fields, &CodecRegistry::with_defaults()).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get::<i64>("id").unwrap(), 1);
        assert_eq!(records[0].get::<String>("name").unwrap(), "alpha");
        assert_eq!(records[1].value("name").unwrap(), &Value::Null);
    }

    #[test]
    fn test_missing_column_is_a_schema_error() {
        let response = response(&["id"], &["1"]);
        let fields = vec![FieldSpec::new("name", SemanticType::String)];
        let err = decode_records(&response, &fields, &CodecRegistry::with_defaults()).unwrap_err();
        assert!(matches!(err, ImpalaError::Schema(_)));
    }

    #[test]
    fn test_unmatched_result_column_is_a_schema_error() {
        let response = response(&["id", "surplus"], &["1\tx"]);
        let fields = vec![FieldSpec::new("id", SemanticType::Int64)];
        let err = decode_records(&response, &fields, &CodecRegistry::with_defaults()).unwrap_err();
        match err {
            ImpalaError::Schema(message) => assert!(message.contains("surplus")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_short_row_is_a_schema_error() {
        let response = response(&["id", "name"], &["1"]);
        let fields = vec![
            FieldSpec::new("id", SemanticType::Int64),
            FieldSpec::new("name", SemanticType::String),
        ];
        let err = decode_records(&response, &fields, &CodecRegistry::with_defaults()).unwrap_err();
        assert!(matches!(err, ImpalaError::Schema(_)));
    }

    #[test]
    fn test_unregistered_type_fails_before_decoding() {
        let response = response(&["id"], &[]);
        let fields = vec![FieldSpec::new("id", SemanticType::Int64)];
        let err = decode_records(&response, &fields, &CodecRegistry::empty()).unwrap_err();
        assert!(matches!(err, ImpalaError::Schema(_)));
    }
}
