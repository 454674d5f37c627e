//! End-to-end runs against PostgreSQL.
//!
//! Set TEST_DATABASE_URL to enable; every test returns early otherwise.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sqlx::PgPool;
use tempfile::TempDir;
use waymark::prelude::*;

async fn test_pool() -> Option<PgPool> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .ok()
}

async fn reset(pool: &PgPool, tables: &[&str]) {
    for table in tables {
        sqlx::query(&format!("DROP TABLE IF EXISTS {} CASCADE", table))
            .execute(pool)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_sql_and_fn_units_interleave() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let state = "waymark_e2e_state";
    let notes = "waymark_e2e_notes";
    reset(&pool, &[state, notes]).await;

    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("0001_create_notes.sql"),
        format!("CREATE TABLE {notes} (id INT PRIMARY KEY, body TEXT NOT NULL);"),
    )
    .unwrap();
    fs::write(
        dir.path().join("0003_seed.sql"),
        format!("INSERT INTO {notes} VALUES (1, 'a; b');\nINSERT INTO {notes} VALUES (2, 'c');"),
    )
    .unwrap();

    let backfill_pool = pool.clone();
    let backfill = FnUnit::new(2, move |_ctx| {
        let pool = backfill_pool.clone();
        async move {
            sqlx::query(&format!("ALTER TABLE {notes} ADD COLUMN tag TEXT"))
                .execute(&pool)
                .await?;
            Ok(())
        }
    })
    .named("add_tag");

    let waymark = Waymark::builder()
        .migrations_dir(dir.path())
        .table_name(state)
        .unit(backfill)
        .build(pool.clone())
        .unwrap();

    let report = waymark.migrate().await.unwrap();
    assert_eq!(report.applied, vec![1, 2, 3]);

    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {notes} WHERE tag IS NULL"))
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2);

    let row: (i64, bool) = sqlx::query_as(&format!("SELECT version, dirty FROM {state}"))
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row, (3, false));

    assert!(waymark.migrate().await.unwrap().is_noop());

    reset(&pool, &[state, notes]).await;
}

#[tokio::test]
async fn test_failed_sql_unit_rolls_back_and_marks_dirty() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let state = "waymark_e2e_dirty_state";
    let items = "waymark_e2e_items";
    reset(&pool, &[state, items]).await;

    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("1_items.sql"),
        format!("CREATE TABLE {items} (id INT PRIMARY KEY);"),
    )
    .unwrap();
    fs::write(
        dir.path().join("2_broken.sql"),
        format!("INSERT INTO {items} VALUES (1);\nINSERT INTO {items} VALUES (1);"),
    )
    .unwrap();

    let third_runs = Arc::new(AtomicUsize::new(0));
    let counter = third_runs.clone();
    let third = FnUnit::new(3, move |_ctx| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let waymark = Waymark::builder()
        .migrations_dir(dir.path())
        .table_name(state)
        .unit(third)
        .build(pool.clone())
        .unwrap();

    let err = waymark.migrate().await.unwrap_err();
    assert_eq!(err.failed_index(), Some(2));
    assert_eq!(third_runs.load(Ordering::SeqCst), 0);

    // The duplicate insert rolled back the whole unit.
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {items}"))
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);

    let status = waymark.status().await.unwrap();
    assert_eq!(status.checkpoint, Some(Checkpoint::dirty(2)));
    assert_eq!(status.pending, vec![3]);

    assert!(matches!(
        waymark.migrate().await,
        Err(MigrateError::Dirty { version: 2 })
    ));

    reset(&pool, &[state, items]).await;
}
