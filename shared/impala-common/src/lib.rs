//! Impala Common Library
//!
//! Shared types for the Impala/Kudu row client: configuration, the error
//! taxonomy, entity schemas, the value codecs, the partition model, statement
//! generation and the RPC collaborator traits the client runtime drives.

pub mod config;
pub mod connection;
pub mod ddl;
pub mod error;
pub mod partitioner;
pub mod schemas;
pub mod types;
pub mod values;

// Re-export commonly used types
pub use config::{ClientConfig, HostAddr, DEFAULT_PORT};
pub use connection::{ImpalaService, ServiceConnector};
pub use error::{ImpalaError, ImpalaResult};
pub use partitioner::{HashPartition, PartitionSet, RangePartition};
pub use schemas::{
    ColumnDef, Entity, EntitySchema, EntitySchemaBuilder, FromRecord, HashPartitionSpec,
    RangePartitionSpec, MILLIS_PER_DAY,
};
pub use types::*;
pub use values::{CodecRegistry, FieldSpec, FromValue, Record, SemanticType, Value};
