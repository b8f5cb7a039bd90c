use piper_caching::{
    spawn_manager, CachedView, InsertOutcome, ManagerConfig, SharedCache, DEFAULT_TOKEN,
};
use piper_core::{DType, NdArray, Value};
use tempfile::TempDir;

fn config(max_size: usize) -> ManagerConfig {
    ManagerConfig {
        address: "127.0.0.1:0".to_string(),
        max_size,
        ..ManagerConfig::default()
    }
}

async fn client(addr: std::net::SocketAddr, dir: &TempDir) -> SharedCache {
    SharedCache::connect(&addr.to_string(), DEFAULT_TOKEN, dir.path().join("cache.lock"))
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_array_round_trip_across_clients() {
    let dir = TempDir::new().unwrap();
    let (addr, manager) = spawn_manager(config(1 << 20)).await.unwrap();
    let writer = client(addr, &dir).await;
    let reader = client(addr, &dir).await;

    let values: Vec<f64> = (0..64).map(|i| i as f64 * 0.5).collect();
    let array = NdArray::from_f64(vec![8, 8], &values).unwrap();
    let outcome = writer
        .insert(&Value::Array(array.clone()), "d1v1_123.IT", "value", "increment")
        .await
        .unwrap();
    assert_eq!(outcome, InsertOutcome::Inserted);

    let lease = reader
        .retrieve("d1v1_123.IT", "value", "increment")
        .await
        .unwrap()
        .expect("entry should be cached");
    match lease.view().unwrap() {
        CachedView::Array { shape, dtype, data } => {
            assert_eq!(shape, &[8, 8]);
            assert_eq!(dtype, DType::F64);
            assert_eq!(data, array.data());
        }
        other => panic!("expected an array view, got {:?}", other),
    }
    assert_eq!(lease.to_value().unwrap(), Value::Array(array));
    lease.release();

    let stats = reader.stats().await.unwrap();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.total_puts, 1);

    writer.quit().await.unwrap();
    manager.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_inserts_store_once() {
    let dir = TempDir::new().unwrap();
    let (addr, manager) = spawn_manager(config(1 << 20)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = client(addr, &dir).await;
        handles.push(tokio::spawn(async move {
            let value = Value::List((0..100).map(Value::Int).collect());
            cache.insert(&value, "shared_key", "p", "f").await.unwrap()
        }));
    }

    let mut inserted = 0;
    for handle in handles {
        if handle.await.unwrap() == InsertOutcome::Inserted {
            inserted += 1;
        }
    }
    assert_eq!(inserted, 1);

    let observer = client(addr, &dir).await;
    assert!(!observer.is_locked("shared_key").await.unwrap());
    assert!(observer.in_cache("shared_key").await.unwrap());
    let stats = observer.stats().await.unwrap();
    assert_eq!(stats.total_puts, 1);
    assert_eq!(stats.locks, stats.unlocks);

    let lease = observer.retrieve("shared_key", "p", "f").await.unwrap().unwrap();
    assert_eq!(
        lease.view().unwrap(),
        CachedView::List((0..100).map(Value::Int).collect())
    );

    observer.quit().await.unwrap();
    manager.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_replace_remove_and_filter() {
    let dir = TempDir::new().unwrap();
    let (addr, manager) = spawn_manager(config(1 << 16)).await.unwrap();
    let cache = client(addr, &dir).await;

    let first = Value::Tuple(vec![Value::Int(1), Value::from("a")]);
    let second = Value::Tuple(vec![Value::Int(2)]);
    assert_eq!(
        cache.insert(&first, "k", "p", "f").await.unwrap(),
        InsertOutcome::Inserted
    );
    assert_eq!(
        cache.insert(&second, "k", "p", "f").await.unwrap(),
        InsertOutcome::Skipped
    );
    assert_eq!(
        cache.replace(&second, "k", "p", "f").await.unwrap(),
        InsertOutcome::Inserted
    );
    let lease = cache.retrieve("k", "p", "f").await.unwrap().unwrap();
    assert_eq!(lease.to_value().unwrap(), second);

    cache.remove("k").await.unwrap();
    assert!(cache.retrieve("k", "p", "f").await.unwrap().is_none());
    // The old mapping survives the unlink
    assert_eq!(lease.to_value().unwrap(), second);

    assert_eq!(
        cache.insert_with_filter(&Value::Int(3), "scalar", "p", "f").await,
        InsertOutcome::Skipped
    );
    assert!(!cache.in_cache("scalar").await.unwrap());

    cache.quit().await.unwrap();
    manager.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_oversized_insert_is_refused() {
    let dir = TempDir::new().unwrap();
    let (addr, manager) = spawn_manager(config(16)).await.unwrap();
    let cache = client(addr, &dir).await;

    let big = NdArray::from_i64(vec![4], &[1, 2, 3, 4]).unwrap();
    assert!(cache.insert(&Value::Array(big), "big", "p", "f").await.is_err());
    assert!(!cache.is_locked("big").await.unwrap());
    assert!(!cache.in_cache("big").await.unwrap());

    cache.quit().await.unwrap();
    manager.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_wrong_token_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (addr, manager) = spawn_manager(config(16)).await.unwrap();
    let result =
        SharedCache::connect(&addr.to_string(), "wrong", dir.path().join("cache.lock")).await;
    assert!(matches!(result, Err(piper_caching::CacheError::Unauthorized)));

    client(addr, &dir).await.quit().await.unwrap();
    manager.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_profile_written_on_quit() {
    let dir = TempDir::new().unwrap();
    let (addr, manager) = spawn_manager(ManagerConfig {
        log_dir: Some(dir.path().to_path_buf()),
        profiling: true,
        ..config(1 << 16)
    })
    .await
    .unwrap();
    let cache = client(addr, &dir).await;

    let value = Value::List(vec![Value::Int(1), Value::Int(2)]);
    cache.insert(&value, "k", "value", "scale").await.unwrap();
    cache.retrieve("k", "value", "scale").await.unwrap().unwrap().release();
    cache.quit().await.unwrap();
    manager.await.unwrap().unwrap();

    let path = dir.path().join(piper_caching::profiler::PROFILE_FILE_NAME);
    let report: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert!(report["functions"].get("scale").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_insert_leaves_no_lock() {
    let dir = TempDir::new().unwrap();
    let (addr, manager) = spawn_manager(config(1 << 20)).await.unwrap();
    let observer = client(addr, &dir).await;

    // Abort at increasing depths so some inserts die with LOCK in flight
    for step in 0..24u32 {
        let cache = client(addr, &dir).await;
        let key = format!("cancelled_{}", step);
        let task_key = key.clone();
        let insert = tokio::spawn(async move {
            let value = Value::List((0..16).map(Value::Int).collect());
            cache.insert(&value, &task_key, "p", "f").await
        });
        for _ in 0..step {
            tokio::task::yield_now().await;
        }
        insert.abort();
        let _ = insert.await;

        let mut released = false;
        for _ in 0..100 {
            if !observer.is_locked(&key).await.unwrap() {
                released = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(released, "{} stayed locked", key);
    }

    observer.quit().await.unwrap();
    manager.await.unwrap().unwrap();
}
