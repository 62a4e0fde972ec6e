pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::PresenceError;

#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub path: String,
    pub value: Option<Value>,
}

pub struct StoreSubscription {
    pub id: Uuid,
    pub events: mpsc::Receiver<StoreEvent>,
}

/// Remote real-time KV store seam. Paths follow `{role}/{destination}/{userId}`.
///
/// `subscribe` delivers the current entries under the prefix as events first,
/// then live updates, ordered per path. `on_disconnect_remove` registers a
/// store-side cleanup that fires if the client connection drops without an
/// explicit `remove`.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn write(&self, path: &str, value: Value) -> Result<(), PresenceError>;

    async fn remove(&self, path: &str) -> Result<(), PresenceError>;

    async fn snapshot(&self, path_prefix: &str) -> Result<Vec<(String, Value)>, PresenceError>;

    async fn subscribe(&self, path_prefix: &str) -> Result<StoreSubscription, PresenceError>;

    async fn on_disconnect_remove(&self, path: &str) -> Result<(), PresenceError>;

    async fn cancel_on_disconnect(&self, path: &str) -> Result<(), PresenceError>;
}
