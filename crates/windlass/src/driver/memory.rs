//! In-memory implementation of EngineDriver for testing

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{BatchOp, DriverError, EngineDriver};
use crate::storage::keys;

/// In-memory implementation of [`EngineDriver`]
///
/// This is primarily for tests and non-durable dev hosts. A `BTreeMap` backs
/// the namespace, so `list` is lexicographic for free, and all batches are
/// applied under one lock (fully atomic).
///
/// # Example
///
/// ```
/// use windlass::InMemoryDriver;
///
/// let driver = InMemoryDriver::new();
/// ```
pub struct InMemoryDriver {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
    alarms: Mutex<HashMap<Uuid, DateTime<Utc>>>,
    message_notify: Notify,
}

impl InMemoryDriver {
    /// Create a new empty driver.
    pub fn new() -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
            alarms: Mutex::new(HashMap::new()),
            message_notify: Notify::new(),
        }
    }

    /// Number of stored keys.
    pub fn key_count(&self) -> usize {
        self.data.lock().len()
    }

    /// Whether a key is present (for tests).
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.lock().contains_key(key)
    }

    /// Currently scheduled alarm for a workflow (for tests).
    pub fn alarm_for(&self, workflow_id: Uuid) -> Option<DateTime<Utc>> {
        self.alarms.lock().get(&workflow_id).copied()
    }

    /// Clear all data (for testing).
    pub fn clear(&self) {
        self.data.lock().clear();
        self.alarms.lock().clear();
    }

    fn range_keys(data: &BTreeMap<String, Vec<u8>>, prefix: &str) -> Vec<String> {
        data.range::<String, _>((Bound::Included(prefix.to_string()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn notify_if_message(&self, key: &str) {
        if key.starts_with(keys::MESSAGE_PREFIX) {
            self.message_notify.notify_waiters();
        }
    }
}

impl Default for InMemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineDriver for InMemoryDriver {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DriverError> {
        Ok(self.data.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), DriverError> {
        self.data.lock().insert(key.to_string(), value);
        self.notify_if_message(key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), DriverError> {
        self.data.lock().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, DriverError> {
        let data = self.data.lock();
        Ok(data
            .range::<String, _>((Bound::Included(prefix.to_string()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), DriverError> {
        let mut data = self.data.lock();
        for key in Self::range_keys(&data, prefix) {
            data.remove(&key);
        }
        Ok(())
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), DriverError> {
        let mut notify_messages = false;
        {
            let mut data = self.data.lock();
            for op in ops {
                match op {
                    BatchOp::Put { key, value } => {
                        notify_messages |= key.starts_with(keys::MESSAGE_PREFIX);
                        data.insert(key, value);
                    }
                    BatchOp::Delete { key } => {
                        data.remove(&key);
                    }
                }
            }
        }
        if notify_messages {
            self.message_notify.notify_waiters();
        }
        Ok(())
    }

    async fn set_alarm(&self, workflow_id: Uuid, at: DateTime<Utc>) -> Result<(), DriverError> {
        self.alarms.lock().insert(workflow_id, at);
        Ok(())
    }

    async fn clear_alarm(&self, workflow_id: Uuid) -> Result<(), DriverError> {
        self.alarms.lock().remove(&workflow_id);
        Ok(())
    }

    async fn wait_for_messages(
        &self,
        _names: &[String],
        token: &CancellationToken,
    ) -> Result<(), DriverError> {
        // Any inbox write resolves the wait; the engine re-checks the inbox
        // against the requested names itself.
        let notified = self.message_notify.notified();
        tokio::select! {
            _ = token.cancelled() => {}
            _ = notified => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_is_lexicographic() {
        let driver = InMemoryDriver::new();
        driver.set("hist/b", vec![2]).await.unwrap();
        driver.set("hist/a", vec![1]).await.unwrap();
        driver.set("hist/a/x", vec![3]).await.unwrap();
        driver.set("name/00000000", vec![4]).await.unwrap();

        let keys: Vec<_> = driver
            .list("hist/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();

        assert_eq!(keys, vec!["hist/a", "hist/a/x", "hist/b"]);
    }

    #[tokio::test]
    async fn test_batch_put_and_delete() {
        let driver = InMemoryDriver::new();
        driver.set("wf/state", b"running".to_vec()).await.unwrap();

        driver
            .batch(vec![
                BatchOp::Put {
                    key: "wf/output".into(),
                    value: b"42".to_vec(),
                },
                BatchOp::Delete {
                    key: "wf/state".into(),
                },
            ])
            .await
            .unwrap();

        assert!(driver.contains_key("wf/output"));
        assert!(!driver.contains_key("wf/state"));
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let driver = InMemoryDriver::new();
        driver.set("hist/loop~00000000/a", vec![]).await.unwrap();
        driver.set("hist/loop~00000000/b", vec![]).await.unwrap();
        driver.set("hist/loop~00000001/a", vec![]).await.unwrap();

        driver.delete_prefix("hist/loop~00000000").await.unwrap();

        assert_eq!(driver.key_count(), 1);
        assert!(driver.contains_key("hist/loop~00000001/a"));
    }

    #[tokio::test]
    async fn test_alarms() {
        let driver = InMemoryDriver::new();
        let id = Uuid::now_v7();
        let at = Utc::now();

        driver.set_alarm(id, at).await.unwrap();
        assert_eq!(driver.alarm_for(id), Some(at));

        driver.clear_alarm(id).await.unwrap();
        assert_eq!(driver.alarm_for(id), None);
    }

    #[tokio::test]
    async fn test_wait_for_messages_wakes_on_inbox_write() {
        let driver = std::sync::Arc::new(InMemoryDriver::new());
        let token = CancellationToken::new();

        let waiter = {
            let driver = driver.clone();
            let token = token.clone();
            tokio::spawn(async move { driver.wait_for_messages(&[], &token).await })
        };

        // Give the waiter a chance to subscribe, then write a message key.
        tokio::task::yield_now().await;
        driver.set("msg/00000000000000000000", vec![]).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap()
            .unwrap();
    }
}
