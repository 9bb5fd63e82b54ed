//! Shared fixtures for the client integration tests

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use impala_client::test_utilities::{FakeCluster, FakeConnector};
use impala_client::ImpalaClient;
use impala_common::{
    ClientConfig, Entity, EntitySchema, FieldSpec, FromRecord, ImpalaError, ImpalaResult, Record,
    SemanticType, Value,
};

pub const DAY_MS: i64 = 86_400_000;

pub fn config(hosts: &[&str], per_host: usize) -> ClientConfig {
    ClientConfig {
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        connections_per_host: per_host,
        reconnect_backoff_ms: 20,
        table_check_backoff_ms: 50,
        lease_timeout_ms: 5_000,
        request_timeout_ms: 10_000,
        statement_timeout_ms: 5_000,
        fetch_poll_interval_ms: 1,
        insert_workers: 2,
        query_workers: 2,
        instance_id: "it".to_string(),
        ..ClientConfig::default()
    }
}

pub fn start(cluster: &FakeCluster, config: ClientConfig) -> ImpalaClient {
    ImpalaClient::start(config, Arc::new(FakeConnector::new(cluster.clone())))
        .expect("client starts")
}

pub async fn wait_for_registered(client: &ImpalaClient, expected: usize) {
    for _ in 0..400 {
        if client.pool_status().await.unwrap().registered == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("pool never reached {expected} registered connections");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low = 0,
    High = 1,
}

/// Row type covering every supported field kind
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: i64,
    pub shard: i32,
    pub name: String,
    pub at: DateTime<Utc>,
    pub elapsed: chrono::Duration,
    pub severity: Severity,
    pub note: Option<String>,
}

impl Event {
    pub fn new(id: i64, at: DateTime<Utc>) -> Self {
        Self {
            id,
            shard: (id % 3) as i32,
            name: format!("event-{}", id),
            at,
            elapsed: chrono::Duration::milliseconds(1_500 * id),
            severity: if id % 2 == 0 { Severity::Low } else { Severity::High },
            note: None,
        }
    }
}

impl Entity for Event {
    fn schema() -> ImpalaResult<EntitySchema> {
        EntitySchema::builder("events")
            .kudu(true)
            .column("id", SemanticType::Int64)
            .column("shard", SemanticType::Int32)
            .column("name", SemanticType::String)
            .column("at", SemanticType::Timestamp)
            .column("elapsed", SemanticType::Duration)
            .column("severity", SemanticType::Enum)
            .nullable_column("note", SemanticType::String)
            .primary_key(["id", "at"])
            .hash_partition(["id"], 2)
            .range_partition("at", 5)
            .build()
    }

    fn values(&self) -> Vec<Value> {
        vec![
            self.id.into(),
            self.shard.into(),
            self.name.clone().into(),
            self.at.into(),
            self.elapsed.into(),
            Value::Enum(self.severity as i32),
            self.note.clone().into(),
        ]
    }
}

impl FromRecord for Event {
    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("id", SemanticType::Int64),
            FieldSpec::new("shard", SemanticType::Int32),
            FieldSpec::new("name", SemanticType::String),
            FieldSpec::new("at", SemanticType::Timestamp),
            FieldSpec::new("elapsed", SemanticType::Duration),
            FieldSpec::new("severity", SemanticType::Enum),
            FieldSpec::nullable("note", SemanticType::String),
        ]
    }

    fn from_record(record: &Record) -> ImpalaResult<Self> {
        let severity = match record.value("severity")? {
            Value::Enum(0) => Severity::Low,
            Value::Enum(1) => Severity::High,
            other => {
                return Err(ImpalaError::Schema(format!(
                    "unknown severity {:?}",
                    other
                )))
            }
        };
        Ok(Self {
            id: record.get("id")?,
            shard: record.get("shard")?,
            name: record.get("name")?,
            at: record.get("at")?,
            elapsed: record.get("elapsed")?,
            severity,
            note: record.get("note")?,
        })
    }
}

/// Day-bucketed row type with a retention window
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub sensor: i64,
    pub at: DateTime<Utc>,
    pub reading: f64,
}

impl Entity for Sample {
    fn schema() -> ImpalaResult<EntitySchema> {
        EntitySchema::builder("samples")
            .database("telemetry")
            .kudu(true)
            .column("sensor", SemanticType::Int64)
            .column("at", SemanticType::Timestamp)
            .column("reading", SemanticType::Double)
            .primary_key(["sensor", "at"])
            .range_partition("at", 1)
            .ttl_days(10)
            .build()
    }

    fn values(&self) -> Vec<Value> {
        vec![self.sensor.into(), self.at.into(), self.reading.into()]
    }
}
