//! Task store unit tests

use std::time::Duration;

use monplane::tasks::{FileTaskStore, MemoryTaskStore, TaskStore};

#[tokio::test]
async fn test_memory_store_put_get_delete() {
    let store = MemoryTaskStore::new();
    store
        .put("task:a", "{\"id\":\"a\"}".to_string(), None)
        .await
        .unwrap();

    assert_eq!(
        store.get("task:a").await.unwrap().as_deref(),
        Some("{\"id\":\"a\"}")
    );

    store.delete("task:a").await.unwrap();
    assert_eq!(store.get("task:a").await.unwrap(), None);
}

#[tokio::test]
async fn test_memory_store_ttl_expires() {
    let store = MemoryTaskStore::new();
    store
        .put("task:gone", "{}".to_string(), Some(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(store.get("task:gone").await.unwrap(), None);

    store
        .put("task:kept", "{}".to_string(), Some(Duration::from_secs(3600)))
        .await
        .unwrap();
    assert!(store.get("task:kept").await.unwrap().is_some());
}

#[tokio::test]
async fn test_memory_store_scan_prefix() {
    let store = MemoryTaskStore::new();
    store.put("task:1", "one".to_string(), None).await.unwrap();
    store.put("task:2", "two".to_string(), None).await.unwrap();
    store
        .put("lock:1", "nope".to_string(), None)
        .await
        .unwrap();

    let mut values = store.scan("task:").await.unwrap();
    values.sort();
    assert_eq!(values, vec!["one".to_string(), "two".to_string()]);
}

#[tokio::test]
async fn test_file_store_survives_reopen() {
    let dir = std::env::temp_dir().join(format!("monplane-store-{}", uuid::Uuid::new_v4()));

    {
        let store = FileTaskStore::open(&dir).await.unwrap();
        store
            .put("task:persisted", "{\"status\":\"running\"}".to_string(), None)
            .await
            .unwrap();
    }

    let reopened = FileTaskStore::open(&dir).await.unwrap();
    assert_eq!(
        reopened.get("task:persisted").await.unwrap().as_deref(),
        Some("{\"status\":\"running\"}")
    );
    let values = reopened.scan("task:").await.unwrap();
    assert_eq!(values.len(), 1);

    tokio::fs::remove_dir_all(&dir).await.unwrap();
}

#[tokio::test]
async fn test_file_store_ttl_expires() {
    let dir = std::env::temp_dir().join(format!("monplane-store-{}", uuid::Uuid::new_v4()));
    let store = FileTaskStore::open(&dir).await.unwrap();

    store
        .put("task:gone", "{}".to_string(), Some(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(store.get("task:gone").await.unwrap(), None);
    assert!(store.scan("task:").await.unwrap().is_empty());

    tokio::fs::remove_dir_all(&dir).await.unwrap();
}
