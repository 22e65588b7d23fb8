/// Integration tests for the store logger: durability, ordering and fidelity
use chrono::{TimeZone, Utc};
use sqlite_logstore::config::{HousekeepingMode, StorageConfig};
use sqlite_logstore::{
    ExceptionInfo, LogLevel, LogRecord, LoggerConfig, PropertyValue, RecordReader, ScopeChain,
    Store, StoreLogger, StoreOptions,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn config_at(path: &Path) -> LoggerConfig {
    let mut config = LoggerConfig {
        storage: StorageConfig::at(path),
        ..LoggerConfig::default()
    };
    config.housekeeping.mode = HousekeepingMode::Manual;
    config.cache.flush_interval_ms = 20;
    config
}

async fn durability_round(n: usize) -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let logger = Arc::new(StoreLogger::open(config_at(&dir.path().join("durable.db"))).await?);

    let producers = 4;
    let mut handles = Vec::new();
    for producer in 0..producers {
        let logger = Arc::clone(&logger);
        handles.push(tokio::spawn(async move {
            for i in (producer..n).step_by(producers) {
                logger
                    .add(
                        LogRecord::builder(LogLevel::Information, "message {Index}")
                            .property("Index", i as i64)
                            .build(),
                    )
                    .expect("add failed");
            }
        }));
    }
    for handle in handles {
        handle.await?;
    }

    logger.flush().await?;
    assert!(logger.wait_until_empty(Duration::from_secs(10)).await);

    let records = logger.reader().get_all().await?;
    assert_eq!(records.len(), n, "N = {}", n);
    assert_eq!(logger.reader().get_count().await?, n as u64);

    let stored: BTreeSet<String> = records.into_iter().map(|r| r.rendered_message).collect();
    let expected: BTreeSet<String> = (0..n).map(|i| format!("message {}", i)).collect();
    assert_eq!(stored, expected);

    logger.dispose().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_durability_under_concurrent_load() -> anyhow::Result<()> {
    for n in [0, 1, 10, 100, 1000] {
        durability_round(n).await?;
    }
    Ok(())
}

// Current-thread runtime: the writer task cannot run until the test awaits,
// so nothing drains while the cache is being overfilled.
#[tokio::test(flavor = "current_thread")]
async fn test_overflow_discards_new_records() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = config_at(&dir.path().join("overflow.db"));
    config.cache.max_cache_size = 10;
    let logger = StoreLogger::open(config).await?;

    for i in 0..15 {
        logger.add(
            LogRecord::builder(LogLevel::Information, "record {Index}")
                .property("Index", i)
                .build(),
        )?;
    }

    assert!(logger.pending_count() <= 10);
    assert!(logger.discarded_count() >= 5);

    logger.flush().await?;
    let records = logger.reader().get_all().await?;
    assert_eq!(records.len(), 10);
    // The first ten were kept; the overflow never reached disk.
    assert_eq!(records[9].rendered_message, "record 9");

    assert_eq!(logger.reset_discarded_count(), 5);
    assert_eq!(logger.discarded_count(), 0);
    logger.dispose().await;
    Ok(())
}

#[tokio::test]
async fn test_records_are_written_in_fifo_order() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = config_at(&dir.path().join("fifo.db"));
    config.cache.batch_size = 2;
    let logger = StoreLogger::open(config).await?;

    for label in ["A", "B", "C", "D", "E"] {
        logger.add(LogRecord::builder(LogLevel::Information, label).build())?;
    }
    logger.flush().await?;

    let records = logger.reader().get_all().await?;
    let labels: Vec<&str> = records.iter().map(|r| r.message_template.as_str()).collect();
    assert_eq!(labels, vec!["A", "B", "C", "D", "E"]);

    let ids: Vec<i64> = records.iter().filter_map(|r| r.id()).collect();
    assert_eq!(ids.len(), 5);
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));

    logger.dispose().await;
    Ok(())
}

#[tokio::test]
async fn test_properties_round_trip_with_types() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let logger = StoreLogger::open(config_at(&dir.path().join("props.db"))).await?;
    let login_time = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();

    let record = LogRecord::builder(LogLevel::Information, "User {Username} logged in at {LoginTime}")
        .category("Auth")
        .event(1001, Some("UserLogin".to_string()))
        .property("Username", "alice")
        .property("LoginTime", login_time)
        .property("Attempts", 3)
        .property("Ratio", 0.25)
        .property("Admin", false)
        .property("Nickname", PropertyValue::Null)
        .build();
    logger.add(record.clone())?;
    logger.flush().await?;

    let stored = logger.reader().get_all().await?;
    assert_eq!(stored.len(), 1);
    let stored = &stored[0];

    assert_eq!(stored.property("Username"), Some(&PropertyValue::from("alice")));
    assert_eq!(
        stored.property("LoginTime"),
        Some(&PropertyValue::Timestamp(login_time))
    );
    assert_eq!(stored.property("Attempts"), Some(&PropertyValue::Integer(3)));
    assert_eq!(stored.property("Ratio"), Some(&PropertyValue::Float(0.25)));
    assert_eq!(stored.property("Admin"), Some(&PropertyValue::Bool(false)));
    assert_eq!(stored.property("Nickname"), Some(&PropertyValue::Null));

    assert_eq!(stored.properties, record.properties);
    assert_eq!(stored.timestamp, record.timestamp);
    assert_eq!(stored.rendered_message, record.rendered_message);
    assert_eq!(stored.category.as_deref(), Some("Auth"));
    assert_eq!(stored.event_id, 1001);
    assert_eq!(stored.event_name.as_deref(), Some("UserLogin"));
    assert_eq!(stored.thread_id, record.thread_id);

    let by_user = logger
        .reader()
        .get_by_property("LoginTime", &PropertyValue::Timestamp(login_time))
        .await?;
    assert_eq!(by_user.len(), 1);

    logger.dispose().await;
    Ok(())
}

#[tokio::test]
async fn test_exception_chain_round_trips() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let logger = StoreLogger::open(config_at(&dir.path().join("exception.db"))).await?;

    let exception = ExceptionInfo::new("InvalidOperationException", "Outer failure")
        .with_stack_trace("at Orders.Submit()")
        .with_data("OrderId", "42")
        .with_inner(ExceptionInfo::new("ArgumentException", "Inner cause"));
    logger.add(
        LogRecord::builder(LogLevel::Error, "Order failed")
            .exception(exception.clone())
            .build(),
    )?;
    logger.add(LogRecord::builder(LogLevel::Information, "No exception").build())?;
    logger.flush().await?;

    let records = logger.reader().get_all().await?;
    let stored = records[0].exception.as_ref().expect("exception missing");
    assert_eq!(stored, &exception);
    assert_eq!(stored.type_name, "InvalidOperationException");
    assert_eq!(stored.message, "Outer failure");

    let inner = stored.inner.as_deref().expect("inner exception missing");
    assert_eq!(inner.type_name, "ArgumentException");
    assert_eq!(inner.message, "Inner cause");
    assert!(records[1].exception.is_none());

    let raw = logger
        .reader()
        .select_raw("SELECT exception_json FROM log_records ORDER BY id")
        .await?;
    assert_eq!(raw[1][0].1, serde_json::Value::from(""));

    logger.dispose().await;
    Ok(())
}

#[tokio::test]
async fn test_nested_scopes_are_persisted() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let logger = StoreLogger::open(config_at(&dir.path().join("scopes.db"))).await?;

    let mut scopes = ScopeChain::new();
    scopes.push_state("Outer");
    scopes.push_state("Inner");
    logger.add(
        LogRecord::builder(LogLevel::Information, "Inside both")
            .scopes(scopes)
            .build(),
    )?;
    logger.add(LogRecord::builder(LogLevel::Information, "Outside").build())?;
    logger.flush().await?;

    let records = logger.reader().get_all().await?;
    let stored = records[0].scopes.as_ref().expect("scopes missing");
    let values: Vec<&str> = stored.values().collect();
    assert_eq!(values, vec!["Outer", "Inner"]);
    assert!(records[1].scopes.is_none());

    let raw = logger
        .reader()
        .select_raw("SELECT scopes_json FROM log_records ORDER BY id")
        .await?;
    assert_eq!(raw[1][0].1, serde_json::Value::Null);

    logger.dispose().await;
    Ok(())
}

#[tokio::test]
async fn test_schema_creation_is_idempotent() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("shared.db");

    let first = StoreLogger::open(config_at(&path)).await?;
    let second = StoreLogger::open(config_at(&path)).await?;

    first.add(LogRecord::builder(LogLevel::Information, "from first").build())?;
    first.flush().await?;
    assert_eq!(second.reader().get_count().await?, 1);

    let store = Arc::new(Store::open(StoreOptions::new(&path)).await?);
    sqlite_logstore::store::ensure_table(&store).await?;
    assert_eq!(RecordReader::new(store).get_count().await?, 1);

    second.dispose().await;
    first.dispose().await;
    Ok(())
}

#[tokio::test]
async fn test_recent_and_level_queries() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let logger = StoreLogger::open(config_at(&dir.path().join("queries.db"))).await?;
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    let levels = [LogLevel::Debug, LogLevel::Warning, LogLevel::Error, LogLevel::Information];
    for (minute, level) in levels.into_iter().enumerate() {
        logger.add(
            LogRecord::builder(level, "minute {Minute}")
                .timestamp(base + chrono::Duration::minutes(minute as i64))
                .property("Minute", minute as i64)
                .build(),
        )?;
    }
    logger.flush().await?;

    let recent = logger.reader().get_recent(2).await?;
    let messages: Vec<&str> = recent.iter().map(|r| r.rendered_message.as_str()).collect();
    assert_eq!(messages, vec!["minute 3", "minute 2"]);

    let severe = logger.reader().get_by_level(LogLevel::Warning).await?;
    assert_eq!(severe.len(), 2);

    assert_eq!(logger.delete_all().await?, 4);
    assert_eq!(logger.reader().get_count().await?, 0);

    logger.dispose().await;
    Ok(())
}
