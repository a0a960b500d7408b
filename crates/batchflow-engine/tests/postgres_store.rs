//! Postgres-backed loader and run store tests
//!
//! Skipped unless DATABASE_URL points at a scratch database. Every test
//! works in tables with a random suffix and drops them afterwards.

use batchflow_common::{Column, ColumnType, Schema, TabularBatch, Value};
use batchflow_engine::db::{create_pool, DbConfig};
use batchflow_engine::joblog::{JobLogger, RunOutcome};
use batchflow_engine::load::LoadProgress;
use batchflow_engine::{
    JobStatus, LoadStrategy, Loader, PgRunStore, PgTableStore, RetryPolicy, TableStore,
};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

async fn pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    Some(create_pool(&DbConfig::new(url)).await.unwrap())
}

fn suffix() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn batch(rows: &[(i64, &str)]) -> TabularBatch {
    let schema = Schema::new(vec![
        Column::new("id", ColumnType::Int),
        Column::new("name", ColumnType::String),
    ])
    .unwrap();
    TabularBatch::from_rows(
        schema,
        rows.iter()
            .map(|(id, name)| vec![Value::Int(*id), Value::from(*name)])
            .collect(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_replace_and_upsert_round_trip() {
    let Some(pool) = pool().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    let table = format!("bf_people_{}", suffix());
    sqlx::query(&format!(
        "CREATE TABLE {} (id BIGINT PRIMARY KEY, name TEXT, loaded_at TIMESTAMPTZ DEFAULT now())",
        table
    ))
    .execute(&pool)
    .await
    .unwrap();

    let store = Arc::new(PgTableStore::new(pool.clone()));
    let loader = Loader::new(store.clone(), 2, RetryPolicy::none());
    let initial = batch(&[(1, "ann"), (2, "bob"), (3, "cy")]);

    for _ in 0..2 {
        let result = loader
            .load("people", &initial, &table, LoadStrategy::Replace, None, &LoadProgress::default())
            .await
            .unwrap();
        assert_eq!(result.chunks_total, 2);
        assert_eq!(store.row_count(&table).await.unwrap(), 3);
    }

    let key = vec!["id".to_string()];
    loader
        .load(
            "people",
            &batch(&[(2, "bobby"), (4, "dee")]),
            &table,
            LoadStrategy::Upsert,
            Some(&key),
            &LoadProgress::default(),
        )
        .await
        .unwrap();

    let mut contents = store.fetch_table(&table).await.unwrap().rows().to_vec();
    contents.sort_by_key(|row| match row[0] {
        Value::Int(id) => id,
        _ => i64::MAX,
    });
    let names: Vec<Value> = contents.iter().map(|row| row[1].clone()).collect();
    assert_eq!(
        names,
        vec![
            Value::from("ann"),
            Value::from("bobby"),
            Value::from("cy"),
            Value::from("dee")
        ]
    );

    sqlx::query(&format!("DROP TABLE {}", table))
        .execute(&pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unknown_column_is_rejected() {
    let Some(pool) = pool().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    let table = format!("bf_narrow_{}", suffix());
    sqlx::query(&format!("CREATE TABLE {} (id BIGINT)", table))
        .execute(&pool)
        .await
        .unwrap();

    let loader = Loader::new(Arc::new(PgTableStore::new(pool.clone())), 10, RetryPolicy::none());
    let err = loader
        .load("narrow", &batch(&[(1, "x")]), &table, LoadStrategy::Append, None, &LoadProgress::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("name"));

    sqlx::query(&format!("DROP TABLE {}", table))
        .execute(&pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_run_store_lifecycle() {
    let Some(pool) = pool().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    let suffix = suffix();
    let runs_table = format!("public.bf_runs_{}", suffix);
    let metrics_table = format!("public.bf_metrics_{}", suffix);
    let store = PgRunStore::with_tables(pool.clone(), &runs_table, &metrics_table).unwrap();
    store.ensure_tables().await.unwrap();
    let logger = JobLogger::new(Arc::new(store));

    let handle = logger.start("orders", "analytics.orders").await.unwrap();
    let handle = logger.advance(handle, JobStatus::Loading).await.unwrap();
    let mut outcome = RunOutcome::new(JobStatus::Success);
    outcome.records_processed = 7;
    outcome.records_loaded = 7;
    outcome.metadata = serde_json::json!({"table_row_count": 7});
    let run = logger.finish(handle, outcome).await.unwrap();

    let last = logger.last_successful("orders").await.unwrap().unwrap();
    assert_eq!(last.run_id, run.run_id);
    assert_eq!(last.table_row_count(), Some(7));
    assert_eq!(
        logger
            .last_successful_for_table("analytics.orders")
            .await
            .unwrap()
            .map(|r| r.run_id),
        Some(run.run_id)
    );
    assert_eq!(logger.recent_runs("orders", 10).await.unwrap().len(), 1);

    for table in [&runs_table, &metrics_table] {
        sqlx::query(&format!("DROP TABLE {}", table))
            .execute(&pool)
            .await
            .unwrap();
    }
}
