//! Entity schemas for Impala/Kudu tables
//!
//! A row type describes its table once through [`EntitySchema::builder`]:
//! table and database names, the Kudu storage flag, ordered columns with
//! their semantic types, and optional hash and range partitioning. The
//! client resolves each type's schema a single time and caches it.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{ImpalaError, ImpalaResult};
use crate::values::{FieldSpec, Record, SemanticType, Value};

/// Milliseconds in one day, the unit of range bucket sizes
pub const MILLIS_PER_DAY: i64 = 86_400_000;

/// One table column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: SemanticType,
    pub nullable: bool,
    pub primary_key: bool,
}

/// `PARTITION BY HASH (columns) PARTITIONS buckets`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashPartitionSpec {
    pub columns: Vec<String>,
    pub buckets: u32,
}

/// Range partitioning over one integer or temporal column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangePartitionSpec {
    pub column: String,
    /// Width of one range partition, in days
    pub bucket_days: u32,
    /// Partitions ending this many days in the past may be dropped
    pub ttl_days: Option<u32>,
}

impl RangePartitionSpec {
    /// Width of one range partition in key units (milliseconds)
    pub fn bucket_size(&self) -> i64 {
        i64::from(self.bucket_days) * MILLIS_PER_DAY
    }

    pub fn ttl_millis(&self) -> Option<i64> {
        self.ttl_days.map(|days| i64::from(days) * MILLIS_PER_DAY)
    }
}

/// Resolved table description for one row type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub database: Option<String>,
    pub table: String,
    pub kudu: bool,
    pub columns: Vec<ColumnDef>,
    pub hash_partition: Option<HashPartitionSpec>,
    pub range_partition: Option<RangePartitionSpec>,
    pub replicas: Option<u32>,
}

impl EntitySchema {
    pub fn builder(table: impl Into<String>) -> EntitySchemaBuilder {
        EntitySchemaBuilder::new(table)
    }

    /// Database the table lives in, falling back to the client default
    pub fn database_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.database.as_deref().unwrap_or(default)
    }

    /// `database.table`
    pub fn qualified_name(&self, default_database: &str) -> String {
        format!("{}.{}", self.database_or(default_database), self.table)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Query-side destination fields matching this table's columns
    pub fn field_specs(&self) -> Vec<FieldSpec> {
        self.columns
            .iter()
            .map(|c| FieldSpec {
                name: c.name.clone(),
                ty: c.ty,
                nullable: c.nullable,
            })
            .collect()
    }

    /// Check a row against the column list before it is encoded
    pub fn check_row(&self, row: &[Value]) -> ImpalaResult<()> {
        if row.len() != self.columns.len() {
            return Err(ImpalaError::Schema(format!(
                "row for table {} has {} values, expected {}",
                self.table,
                row.len(),
                self.columns.len()
            )));
        }
        for (column, value) in self.columns.iter().zip(row) {
            if value.is_null() && !column.nullable {
                return Err(ImpalaError::Schema(format!(
                    "column {}.{} is NOT NULL but the row holds null",
                    self.table, column.name
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`EntitySchema`]
#[derive(Debug, Clone)]
pub struct EntitySchemaBuilder {
    database: Option<String>,
    table: String,
    kudu: bool,
    columns: Vec<ColumnDef>,
    primary_key: Vec<String>,
    hash_partition: Option<HashPartitionSpec>,
    range_partition: Option<RangePartitionSpec>,
    replicas: Option<u32>,
}

impl EntitySchemaBuilder {
    fn new(table: impl Into<String>) -> Self {
        Self {
            database: None,
            table: table.into(),
            kudu: false,
            columns: Vec::new(),
            primary_key: Vec::new(),
            hash_partition: None,
            range_partition: None,
            replicas: None,
        }
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Store the table in Kudu (`STORED AS KUDU`)
    pub fn kudu(mut self, kudu: bool) -> Self {
        self.kudu = kudu;
        self
    }

    pub fn column(mut self, name: impl Into<String>, ty: SemanticType) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            ty,
            nullable: false,
            primary_key: false,
        });
        self
    }

    pub fn nullable_column(mut self, name: impl Into<String>, ty: SemanticType) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            ty,
            nullable: true,
            primary_key: false,
        });
        self
    }

    /// Mark existing columns as the primary key, in key order
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn hash_partition<I, S>(mut self, columns: I, buckets: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hash_partition = Some(HashPartitionSpec {
            columns: columns.into_iter().map(Into::into).collect(),
            buckets,
        });
        self
    }

    pub fn range_partition(mut self, column: impl Into<String>, bucket_days: u32) -> Self {
        let ttl_days = self.range_partition.as_ref().and_then(|r| r.ttl_days);
        self.range_partition = Some(RangePartitionSpec {
            column: column.into(),
            bucket_days,
            ttl_days,
        });
        self
    }

    /// Retention for range partitions; requires a range partition spec
    pub fn ttl_days(mut self, days: u32) -> Self {
        if let Some(range) = self.range_partition.as_mut() {
            range.ttl_days = Some(days);
        } else {
            // Remembered until range_partition is declared
            self.range_partition = Some(RangePartitionSpec {
                column: String::new(),
                bucket_days: 0,
                ttl_days: Some(days),
            });
        }
        self
    }

    /// `kudu.num_tablet_replicas`
    pub fn replicas(mut self, replicas: u32) -> Self {
        self.replicas = Some(replicas);
        self
    }

    pub fn build(self) -> ImpalaResult<EntitySchema> {
        let invalid = |message: String| Err(ImpalaError::Schema(message));

        if self.table.trim().is_empty() {
            return invalid("table name cannot be empty".to_string());
        }
        if self.columns.is_empty() {
            return invalid(format!("table {} declares no columns", self.table));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if column.name.trim().is_empty() {
                return invalid(format!("table {} has a column without a name", self.table));
            }
            if !seen.insert(column.name.to_lowercase()) {
                return invalid(format!(
                    "duplicate column {} in table {}",
                    column.name, self.table
                ));
            }
        }

        let mut columns = self.columns;
        for key in &self.primary_key {
            match columns
                .iter_mut()
                .find(|c| c.name.eq_ignore_ascii_case(key))
            {
                Some(column) if column.nullable => {
                    return invalid(format!("primary key column {} cannot be nullable", key));
                }
                Some(column) => column.primary_key = true,
                None => {
                    return invalid(format!(
                        "primary key column {} not found in table {}",
                        key, self.table
                    ))
                }
            }
        }

        if let Some(hash) = &self.hash_partition {
            if hash.buckets < 2 {
                return invalid(format!(
                    "hash partitioning of {} needs at least 2 buckets, got {}",
                    self.table, hash.buckets
                ));
            }
            if hash.columns.is_empty() {
                return invalid(format!("hash partitioning of {} names no columns", self.table));
            }
            for name in &hash.columns {
                if !columns.iter().any(|c| c.name.eq_ignore_ascii_case(name)) {
                    return invalid(format!(
                        "hash partition column {} not found in table {}",
                        name, self.table
                    ));
                }
            }
        }

        if let Some(range) = &self.range_partition {
            if range.column.is_empty() {
                return invalid(format!(
                    "ttl declared for {} without a range partition",
                    self.table
                ));
            }
            let column = columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(&range.column))
                .ok_or_else(|| {
                    ImpalaError::Schema(format!(
                        "range partition column {} not found in table {}",
                        range.column, self.table
                    ))
                })?;
            if !matches!(
                column.ty,
                SemanticType::Timestamp | SemanticType::Int32 | SemanticType::Int64
            ) {
                return invalid(format!(
                    "range partition column {} has type {}; valid types are Timestamp, Int32 and Int64",
                    column.name, column.ty
                ));
            }
            if range.bucket_days == 0 {
                return invalid(format!(
                    "range partition bucket size of {} must be at least 1 day",
                    self.table
                ));
            }
            if range.ttl_days == Some(0) {
                return invalid(format!("ttl of {} must be at least 1 day", self.table));
            }
        }

        if self.replicas == Some(0) {
            return invalid(format!("replica count of {} must be at least 1", self.table));
        }

        Ok(EntitySchema {
            database: self.database,
            table: self.table,
            kudu: self.kudu,
            columns,
            hash_partition: self.hash_partition,
            range_partition: self.range_partition,
            replicas: self.replicas,
        })
    }
}

/// A row type that can be inserted
pub trait Entity: Send + Sync + 'static {
    /// Table description, resolved once per client
    fn schema() -> ImpalaResult<EntitySchema>;

    /// Column values in declared column order
    fn values(&self) -> Vec<Value>;
}

/// A row type that query results decode into
pub trait FromRecord: Sized + Send + 'static {
    /// Destination fields matched against result columns by name
    fn fields() -> Vec<FieldSpec>;

    fn from_record(record: &Record) -> ImpalaResult<Self>;
}
