use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::PresenceError;
use crate::store::{PresenceStore, StoreEvent, StoreSubscription};

struct Subscriber {
    prefix: String,
    tx: mpsc::Sender<StoreEvent>,
}

/// In-process store backend. Fans every write/remove out to matching
/// subscribers and honors disconnect hooks via `trigger_disconnect`.
pub struct MemoryStore {
    entries: DashMap<String, Value>,
    subscribers: DashMap<Uuid, Subscriber>,
    disconnect_paths: DashSet<String>,
    event_buffer: usize,
}

impl MemoryStore {
    pub fn new(event_buffer: usize) -> Self {
        Self {
            entries: DashMap::new(),
            subscribers: DashMap::new(),
            disconnect_paths: DashSet::new(),
            event_buffer,
        }
    }

    /// Simulates the server noticing a dropped connection: every registered
    /// disconnect hook fires, removing its path.
    pub async fn trigger_disconnect(&self) {
        let paths: Vec<String> = self.disconnect_paths.iter().map(|p| p.clone()).collect();
        self.disconnect_paths.clear();

        for path in paths {
            debug!(path = %path, "disconnect hook fired");
            if self.entries.remove(&path).is_some() {
                self.fan_out(StoreEvent {
                    path,
                    value: None,
                })
                .await;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn matches(prefix: &str, path: &str) -> bool {
        match path.strip_prefix(prefix) {
            Some("") => true,
            Some(rest) => rest.starts_with('/'),
            None => false,
        }
    }

    async fn fan_out(&self, event: StoreEvent) {
        let targets: Vec<(Uuid, mpsc::Sender<StoreEvent>)> = self
            .subscribers
            .iter()
            .filter(|entry| Self::matches(&entry.prefix, &event.path))
            .map(|entry| (*entry.key(), entry.tx.clone()))
            .collect();

        for (id, tx) in targets {
            if tx.send(event.clone()).await.is_err() {
                self.subscribers.remove(&id);
            }
        }
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn write(&self, path: &str, value: Value) -> Result<(), PresenceError> {
        self.entries.insert(path.to_string(), value.clone());
        self.fan_out(StoreEvent {
            path: path.to_string(),
            value: Some(value),
        })
        .await;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), PresenceError> {
        if self.entries.remove(path).is_some() {
            self.fan_out(StoreEvent {
                path: path.to_string(),
                value: None,
            })
            .await;
        }
        Ok(())
    }

    async fn snapshot(&self, path_prefix: &str) -> Result<Vec<(String, Value)>, PresenceError> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| Self::matches(path_prefix, entry.key()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    async fn subscribe(&self, path_prefix: &str) -> Result<StoreSubscription, PresenceError> {
        let existing = self.snapshot(path_prefix).await?;
        let capacity = self.event_buffer.max(existing.len() + 1);
        let (tx, rx) = mpsc::channel(capacity);

        for (path, value) in existing {
            tx.try_send(StoreEvent {
                path,
                value: Some(value),
            })
            .map_err(|err| PresenceError::Internal(format!("subscribe backlog: {err}")))?;
        }

        let id = Uuid::new_v4();
        self.subscribers.insert(
            id,
            Subscriber {
                prefix: path_prefix.to_string(),
                tx,
            },
        );

        Ok(StoreSubscription { id, events: rx })
    }

    async fn on_disconnect_remove(&self, path: &str) -> Result<(), PresenceError> {
        self.disconnect_paths.insert(path.to_string());
        Ok(())
    }

    async fn cancel_on_disconnect(&self, path: &str) -> Result<(), PresenceError> {
        self.disconnect_paths.remove(path);
        Ok(())
    }
}
