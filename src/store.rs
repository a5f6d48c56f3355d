use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// In-memory key/value map scoped to one node. Holds both primary entries
/// and replica copies; which is which is the ring node's concern, not the
/// store's. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct Store {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().await.get(key).cloned()
    }

    // overwrites any existing value
    pub async fn set(&self, key: String, value: Vec<u8>) {
        self.entries.lock().await.insert(key, value);
    }

    // no-op when the key is absent
    pub async fn delete(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }

    pub async fn dump(&self) -> HashMap<String, Vec<u8>> {
        self.entries.lock().await.clone()
    }
}
