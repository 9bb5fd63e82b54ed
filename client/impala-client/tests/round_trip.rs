//! Rows written through the client read back unchanged

mod common;

use chrono::{TimeZone, Utc};

use common::{config, start, Event, Severity};
use impala_client::test_utilities::FakeCluster;
use impala_common::{Entity, FieldSpec, FromRecord, ImpalaError, SemanticType};

#[tokio::test]
async fn test_every_field_kind_survives_a_round_trip() {
    let cluster = FakeCluster::new();
    cluster.set_rows_per_fetch(2);
    let client = start(&cluster, config(&["impala-1", "impala-2"], 1));

    let at = Utc.with_ymd_and_hms(2023, 11, 5, 14, 30, 15).unwrap() + chrono::Duration::milliseconds(250);
    let mut rows: Vec<Event> = (1..=5)
        .map(|id| Event::new(id, at + chrono::Duration::days(id)))
        .collect();
    rows[0].name = r#"quote " and backslash \ inside"#.to_string();
    rows[1].note = Some("with, commas (and parens)".to_string());
    rows[2].shard = -42;
    rows[3].elapsed = chrono::Duration::zero();
    rows[4].severity = Severity::Low;

    let result = client.insert(&rows).await.unwrap();
    assert_eq!(result.rows_modified, 5);

    let read: Vec<Event> = client
        .query("select * from default.events order by id")
        .await
        .unwrap();
    assert_eq!(read, rows);
}

#[tokio::test]
async fn test_table_fields_derive_the_query_fields() {
    let schema = Event::schema().unwrap();
    let derived: Vec<_> = schema.field_specs();
    assert_eq!(derived, Event::fields());
}

#[tokio::test]
async fn test_projection_must_name_only_target_fields() {
    let cluster = FakeCluster::new();
    let client = start(&cluster, config(&["impala-1"], 1));
    let at = Utc.with_ymd_and_hms(2024, 4, 4, 4, 4, 4).unwrap();
    client.insert(&[Event::new(8, at)]).await.unwrap();

    let id_only = vec![FieldSpec::new("id", SemanticType::Int64)];
    let err = client
        .query_records("select name, id from default.events", id_only.clone())
        .await
        .unwrap_err();
    match err {
        ImpalaError::Schema(message) => assert!(message.contains("name")),
        other => panic!("unexpected error: {other:?}"),
    }

    let records = client
        .query_records("select ID from default.events", id_only)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get::<i64>("id").unwrap(), 8);
    assert_eq!(records[0].len(), 1);
}
