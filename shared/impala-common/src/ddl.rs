//! SQL statement generation
//!
//! Builds the DDL and DML text the client sends: database switching, table
//! listing, Kudu `CREATE TABLE` with hash and range partitioning, range
//! partition maintenance and multi-row `INSERT`/`UPSERT` statements.

use crate::error::{ImpalaError, ImpalaResult};
use crate::partitioner::RangePartition;
use crate::schemas::EntitySchema;
use crate::values::{CodecRegistry, Value};

/// Table property holding the Kudu tablet replica count
pub const REPLICAS_PROPERTY: &str = "kudu.num_tablet_replicas";

pub fn use_database(database: &str) -> String {
    format!("use {};", database)
}

pub fn show_tables() -> String {
    "show tables;".to_string()
}

pub fn show_databases() -> String {
    "show databases;".to_string()
}

pub fn show_create_table(qualified_table: &str) -> String {
    format!("show create table {};", qualified_table)
}

pub fn show_range_partitions(qualified_table: &str) -> String {
    format!("show range partitions {};", qualified_table)
}

/// Generate `CREATE TABLE` for a schema
///
/// The range clause bootstraps the table with a single `VALUE = 0` partition;
/// real buckets are added on demand. `replicas` is the fallback used when the
/// schema declares no replica count.
pub fn create_table(
    schema: &EntitySchema,
    registry: &CodecRegistry,
    replicas: Option<u32>,
) -> ImpalaResult<String> {
    let mut sql = format!("CREATE TABLE {} (\n", schema.table);

    let mut definitions = Vec::with_capacity(schema.columns.len() + 1);
    for column in &schema.columns {
        let storage_type = registry.storage_type(column.ty)?;
        let nullability = if column.nullable { "NULL" } else { "NOT NULL" };
        definitions.push(format!(
            "    {} {} {}",
            column.name, storage_type, nullability
        ));
    }

    let keys = schema.primary_key_columns();
    if !keys.is_empty() {
        definitions.push(format!("    PRIMARY KEY ({})", keys.join(", ")));
    }
    sql.push_str(&definitions.join(",\n"));
    sql.push_str("\n)\n");

    if let Some(hash) = &schema.hash_partition {
        sql.push_str(&format!(
            "PARTITION BY HASH ({}) PARTITIONS {}\n",
            hash.columns.join(", "),
            hash.buckets
        ));
    }

    if let Some(range) = &schema.range_partition {
        let prefix = if schema.hash_partition.is_some() {
            ","
        } else {
            "PARTITION BY"
        };
        sql.push_str(&format!(
            "{} RANGE({}) (PARTITION VALUE = 0)\n",
            prefix, range.column
        ));
    }

    if schema.kudu {
        sql.push_str("STORED AS KUDU\n");
    }

    if let Some(replicas) = schema.replicas.or(replicas) {
        sql.push_str(&format!(
            "TBLPROPERTIES('{}' = '{}')\n",
            REPLICAS_PROPERTY, replicas
        ));
    }

    sql.push(';');
    Ok(sql)
}

pub fn add_range_partition(qualified_table: &str, range: &RangePartition) -> String {
    format!(
        "ALTER TABLE {} ADD RANGE PARTITION {};",
        qualified_table, range
    )
}

pub fn drop_range_partition(qualified_table: &str, range: &RangePartition) -> String {
    format!(
        "ALTER TABLE {} DROP RANGE PARTITION {};",
        qualified_table, range
    )
}

/// Generate one multi-row `INSERT` (or `UPSERT`) statement
pub fn insert_statement(
    schema: &EntitySchema,
    qualified_table: &str,
    rows: &[Vec<Value>],
    registry: &CodecRegistry,
    upsert: bool,
) -> ImpalaResult<String> {
    if rows.is_empty() {
        return Err(ImpalaError::InvalidRequest(format!(
            "insert into {} needs at least one row",
            qualified_table
        )));
    }

    let verb = if upsert { "upsert" } else { "insert" };
    let columns = schema.column_names().join(", ");

    let mut tuples = Vec::with_capacity(rows.len());
    for row in rows {
        schema.check_row(row)?;
        let literals = schema
            .columns
            .iter()
            .zip(row)
            .map(|(column, value)| registry.encode(column.ty, value))
            .collect::<ImpalaResult<Vec<_>>>()?;
        tuples.push(format!("({})", literals.join(", ")));
    }

    Ok(format!(
        "{} into {} ({}) values {};",
        verb,
        qualified_table,
        columns,
        tuples.join(", ")
    ))
}
