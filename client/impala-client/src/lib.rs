//! Impala Client
//!
//! Pooled, self-provisioning row client for Impala/Kudu tables. Rows of a
//! registered type are written in bulk; the table and any range partitions
//! the rows need are created on demand. Queries decode into caller types.

pub mod bulk;
pub mod client;
pub mod mailbox;
pub mod pool;
pub mod query;
pub mod session;
pub mod tables;
pub mod tasks;
pub mod telemetry;
pub mod test_utilities;

mod router;

pub use bulk::InsertStage;
pub use client::ImpalaClient;
pub use pool::{ConnectionHandle, ConnectionLease, ConnectionState, PoolHandle, PoolStatus};
pub use query::decode_records;
pub use session::Session;
pub use tables::{AddRangeOutcome, TableEntry, TableHandle, TableState};
pub use telemetry::init_tracing;
