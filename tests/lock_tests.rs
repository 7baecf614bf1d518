/// Cross-connection locking tests
///
/// Two connections share one SQLite file so the migration lock is
/// contended the same way it is between two processes.
/// Run with: cargo test --test lock_tests

use rustmigrate::lock::{acquire, release};
use rustmigrate::{DriverOptions, LockOptions, MemorySource, MigrateError, Migrator, SqliteDriver};
use sqlx::Connection;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn database_url(dir: &Path) -> String {
    format!("sqlite://{}?mode=rwc", dir.join("app.db").display())
}

async fn open(url: &str) -> SqliteDriver {
    SqliteDriver::connect(url, DriverOptions::default())
        .await
        .unwrap()
}

fn logged_source(count: i64) -> MemorySource {
    (1..=count).fold(MemorySource::new(), |source, v| {
        source.with_step(
            v,
            format!("step_{}", v),
            format!("INSERT INTO applied_log (version) VALUES ({});", v),
            format!("DELETE FROM applied_log WHERE version = {};", v),
        )
    })
}

async fn create_log(driver: &mut SqliteDriver) {
    sqlx::query("CREATE TABLE applied_log (version INTEGER NOT NULL)")
        .execute(driver.connection())
        .await
        .unwrap();
}

fn short_wait() -> LockOptions {
    LockOptions {
        timeout: Duration::from_millis(300),
        retry_interval: Duration::from_millis(20),
    }
}

#[tokio::test]
async fn test_second_run_waits_then_times_out() {
    let dir = TempDir::new().unwrap();
    let url = database_url(dir.path());
    let mut holder = open(&url).await;
    let mut contender = open(&url).await;
    create_log(&mut holder).await;

    let handle = acquire(&mut holder, &LockOptions::default()).await.unwrap();

    let migrator = Migrator::new(logged_source(2)).with_lock_options(short_wait());
    let err = migrator.migrate_up(&mut contender).await.unwrap_err();
    match err {
        MigrateError::LockBusy { waited } => assert!(waited >= Duration::from_millis(300)),
        other => panic!("expected LockBusy, got {other:?}"),
    }
    assert!(migrator.current_version(&mut contender).await.unwrap().version.is_none());

    release(&mut holder, handle).await.unwrap();
    assert_eq!(migrator.migrate_up(&mut contender).await.unwrap(), Some(2));
}

#[tokio::test]
async fn test_contender_times_out_while_holder_is_mid_step() {
    let dir = TempDir::new().unwrap();
    let url = database_url(dir.path());
    let mut holder = open(&url).await;
    let mut contender = open(&url).await;

    let handle = acquire(&mut holder, &LockOptions::default()).await.unwrap();
    let mut tx = holder.connection().begin().await.unwrap();
    sqlx::query("CREATE TABLE big (id INTEGER)")
        .execute(&mut *tx)
        .await
        .unwrap();

    let started = Instant::now();
    let migrator = Migrator::new(logged_source(1)).with_lock_options(short_wait());
    let err = migrator.migrate_up(&mut contender).await.unwrap_err();

    assert!(
        matches!(err, MigrateError::LockBusy { .. }),
        "expected LockBusy, got {err:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(2));

    tx.commit().await.unwrap();
    release(&mut holder, handle).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_runs_apply_each_step_once() {
    let dir = TempDir::new().unwrap();
    let url = database_url(dir.path());
    let mut first = open(&url).await;
    let mut second = open(&url).await;
    create_log(&mut first).await;

    let options = LockOptions {
        timeout: Duration::from_secs(10),
        retry_interval: Duration::from_millis(10),
    };
    let a = Migrator::new(logged_source(5)).with_lock_options(options);
    let b = Migrator::new(logged_source(5)).with_lock_options(options);

    let (left, right) = tokio::join!(a.migrate_up(&mut first), b.migrate_up(&mut second));
    assert_eq!(left.unwrap(), Some(5));
    assert_eq!(right.unwrap(), Some(5));

    let executions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM applied_log")
        .fetch_one(first.connection())
        .await
        .unwrap();
    assert_eq!(executions, 5);
}

#[tokio::test]
async fn test_lock_released_after_failed_run() {
    let dir = TempDir::new().unwrap();
    let url = database_url(dir.path());
    let mut first = open(&url).await;
    let mut second = open(&url).await;

    let broken = MemorySource::new().with_step(1, "broken", "INSERT INTO missing VALUES (1);", "");
    Migrator::new(broken)
        .migrate_up(&mut first)
        .await
        .unwrap_err();

    let handle = acquire(&mut second, &short_wait()).await.unwrap();
    release(&mut second, handle).await.unwrap();
}
