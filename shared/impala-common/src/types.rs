//! Result types exchanged with the engine
//!
//! Mirrors what the Beeswax-style RPC hands back: a handle per executed
//! statement, fetch batches of delimited row text, result metadata naming the
//! columns, and the insert summary read when an insert is closed.

use serde::{Deserialize, Serialize};

/// Opaque handle of a running statement
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryHandle {
    pub id: String,
    pub log_context: String,
}

impl QueryHandle {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            log_context: id.clone(),
            id,
        }
    }
}

/// One `Fetch` batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResult {
    /// False while the engine is still producing the first batch
    pub ready: bool,
    /// Column type names
    pub columns: Vec<String>,
    /// Rows as delimited text
    pub rows: Vec<String>,
    pub has_more: bool,
}

impl FetchResult {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn ready(columns: Vec<String>, rows: Vec<String>, has_more: bool) -> Self {
        Self {
            ready: true,
            columns,
            rows,
            has_more,
        }
    }
}

/// Name and type of one result column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub type_name: String,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// `GetResultsMetadata` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsMetadata {
    pub schema: Vec<FieldSchema>,
    pub delimiter: String,
}

impl Default for ResultsMetadata {
    fn default() -> Self {
        Self {
            schema: Vec::new(),
            delimiter: "\t".to_string(),
        }
    }
}

/// `CloseInsert` reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertResult {
    pub rows_modified: i64,
    pub row_errors: i64,
}

/// Everything collected while executing one statement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub metadata: ResultsMetadata,
    pub column_types: Vec<String>,
    /// Raw, undecoded rows
    pub rows: Vec<String>,
    /// Present for statements executed as inserts
    pub insert: Option<InsertResult>,
}

impl QueryResponse {
    pub fn delimiter(&self) -> &str {
        &self.metadata.delimiter
    }

    /// Position of a column by case-insensitive name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.metadata
            .schema
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Split a raw row into cells
    pub fn cells<'a>(&'a self, row: &'a str) -> Vec<&'a str> {
        if self.metadata.delimiter.is_empty() {
            return vec![row];
        }
        row.split(self.metadata.delimiter.as_str()).collect()
    }

    /// First cell of every row, as `show tables` and similar return them
    pub fn first_column(&self) -> Vec<String> {
        self.rows
            .iter()
            .map(|row| {
                self.cells(row)
                    .first()
                    .map(|cell| cell.to_string())
                    .unwrap_or_default()
            })
            .collect()
    }
}
