use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connectivity::ConnectivityMonitor;
use crate::error::PresenceError;
use crate::models::presence::{Destination, PresenceRecord, Role, Segment};
use crate::store::{PresenceStore, StoreEvent, StoreSubscription};

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Added(PresenceRecord),
    Updated(PresenceRecord),
    Removed { user_id: String },
}

impl PeerEvent {
    pub fn user_id(&self) -> &str {
        match self {
            PeerEvent::Added(record) | PeerEvent::Updated(record) => &record.user_id,
            PeerEvent::Removed { user_id } => user_id,
        }
    }
}

pub struct ObserveHandle {
    id: Uuid,
    segment: Segment,
    pub events: ReceiverStream<PeerEvent>,
}

impl ObserveHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn segment(&self) -> Segment {
        self.segment
    }
}

/// Maintains one store subscription per observed segment and fans peer
/// events out to every observer. The local user's own record is filtered.
pub struct PresenceDiscovery {
    store: Arc<dyn PresenceStore>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    local_user_id: String,
    event_buffer: usize,
    feeds: Mutex<HashMap<Segment, FeedEntry>>,
}

struct FeedEntry {
    shared: Arc<FeedShared>,
    task: JoinHandle<()>,
}

struct FeedShared {
    segment: Segment,
    local_user_id: String,
    view: Mutex<HashMap<String, PresenceRecord>>,
    subscribers: Mutex<HashMap<Uuid, mpsc::Sender<PeerEvent>>>,
}

impl PresenceDiscovery {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        local_user_id: &str,
        event_buffer: usize,
    ) -> Self {
        Self {
            store,
            connectivity,
            local_user_id: local_user_id.to_string(),
            event_buffer,
            feeds: Mutex::new(HashMap::new()),
        }
    }

    pub async fn observe(
        &self,
        role: Role,
        destination: Destination,
    ) -> Result<ObserveHandle, PresenceError> {
        let segment = Segment::new(role, destination);
        let mut feeds = self.feeds.lock().await;

        if !feeds.contains_key(&segment) {
            let subscription = self.store.subscribe(&segment.path_prefix()).await?;
            let shared = Arc::new(FeedShared {
                segment,
                local_user_id: self.local_user_id.clone(),
                view: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(HashMap::new()),
            });
            let task = tokio::spawn(run_feed(
                shared.clone(),
                self.store.clone(),
                self.connectivity.watch(),
                subscription,
            ));
            feeds.insert(segment, FeedEntry { shared, task });
            info!(prefix = %segment.path_prefix(), "segment feed started");
        }

        let entry = feeds
            .get(&segment)
            .ok_or_else(|| PresenceError::Internal("segment feed vanished".to_string()))?;

        let id = Uuid::new_v4();
        let view = entry.shared.view.lock().await;
        let mut subscribers = entry.shared.subscribers.lock().await;

        let (tx, rx) = mpsc::channel(self.event_buffer.max(view.len() + 1));
        for record in view.values() {
            let _ = tx.try_send(PeerEvent::Added(record.clone()));
        }
        subscribers.insert(id, tx);

        Ok(ObserveHandle {
            id,
            segment,
            events: ReceiverStream::new(rx),
        })
    }

    pub async fn stop(&self, handle: ObserveHandle) {
        let mut feeds = self.feeds.lock().await;
        let Some(entry) = feeds.get(&handle.segment) else {
            return;
        };

        let remaining = {
            let mut subscribers = entry.shared.subscribers.lock().await;
            subscribers.remove(&handle.id);
            subscribers.len()
        };

        if remaining == 0 {
            if let Some(entry) = feeds.remove(&handle.segment) {
                entry.task.abort();
                info!(prefix = %handle.segment.path_prefix(), "segment feed released");
            }
        }
    }
}

async fn run_feed(
    shared: Arc<FeedShared>,
    store: Arc<dyn PresenceStore>,
    mut connectivity: watch::Receiver<bool>,
    mut subscription: StoreSubscription,
) {
    let mut online = *connectivity.borrow();

    loop {
        tokio::select! {
            event = subscription.events.recv() => match event {
                Some(event) => shared.apply_store_event(event).await,
                None => {
                    debug!(prefix = %shared.segment.path_prefix(), "store subscription closed");
                    break;
                }
            },
            changed = connectivity.changed() => {
                if changed.is_err() {
                    // connectivity source is gone; keep draining store events
                    while let Some(event) = subscription.events.recv().await {
                        shared.apply_store_event(event).await;
                    }
                    break;
                }
                let now_online = *connectivity.borrow();
                if now_online && !online {
                    if let Err(err) = shared.resync(store.as_ref()).await {
                        warn!(error = %err, "segment resync after reconnect failed");
                    }
                }
                online = now_online;
            }
        }
    }
}

impl FeedShared {
    async fn apply_store_event(&self, event: StoreEvent) {
        let Some((segment, user_id)) = Segment::parse_path(&event.path) else {
            warn!(path = %event.path, "ignoring malformed store path");
            return;
        };
        if segment != self.segment || user_id == self.local_user_id {
            return;
        }

        let mut view = self.view.lock().await;
        match event.value {
            Some(value) => match serde_json::from_value::<PresenceRecord>(value) {
                Ok(record) => {
                    let peer_event = if view.contains_key(user_id) {
                        PeerEvent::Updated(record.clone())
                    } else {
                        PeerEvent::Added(record.clone())
                    };
                    view.insert(user_id.to_string(), record);
                    self.emit(peer_event).await;
                }
                Err(err) => {
                    warn!(user_id, error = %err, "dropping malformed presence record");
                }
            },
            None => {
                if view.remove(user_id).is_some() {
                    self.emit(PeerEvent::Removed {
                        user_id: user_id.to_string(),
                    })
                    .await;
                }
            }
        }
    }

    /// Full reconcile against a fresh snapshot; observers receive synthetic
    /// Added/Updated/Removed events instead of reconnect-special handling.
    async fn resync(&self, store: &dyn PresenceStore) -> Result<(), PresenceError> {
        let snapshot = store.snapshot(&self.segment.path_prefix()).await?;

        let mut fresh: HashMap<String, PresenceRecord> = HashMap::new();
        for (path, value) in snapshot {
            let Some((segment, user_id)) = Segment::parse_path(&path) else {
                continue;
            };
            if segment != self.segment || user_id == self.local_user_id {
                continue;
            }
            match serde_json::from_value::<PresenceRecord>(value) {
                Ok(record) => {
                    fresh.insert(user_id.to_string(), record);
                }
                Err(err) => warn!(user_id, error = %err, "dropping malformed presence record"),
            }
        }

        let mut view = self.view.lock().await;

        let gone: Vec<String> = view
            .keys()
            .filter(|user_id| !fresh.contains_key(*user_id))
            .cloned()
            .collect();
        for user_id in gone {
            view.remove(&user_id);
            self.emit(PeerEvent::Removed { user_id }).await;
        }

        for (user_id, record) in fresh {
            match view.get(&user_id) {
                Some(previous) if *previous == record => {}
                Some(_) => {
                    view.insert(user_id, record.clone());
                    self.emit(PeerEvent::Updated(record)).await;
                }
                None => {
                    view.insert(user_id, record.clone());
                    self.emit(PeerEvent::Added(record)).await;
                }
            }
        }

        info!(
            prefix = %self.segment.path_prefix(),
            peers = view.len(),
            "segment resynced after reconnect"
        );
        Ok(())
    }

    async fn emit(&self, event: PeerEvent) {
        let targets: Vec<(Uuid, mpsc::Sender<PeerEvent>)> = {
            let subscribers = self.subscribers.lock().await;
            subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in targets {
            if tx.send(event.clone()).await.is_err() {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.lock().await;
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }
}
