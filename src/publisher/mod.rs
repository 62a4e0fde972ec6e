use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::error::PresenceError;
use crate::models::presence::{Destination, GeoPoint, PresenceRecord, Role, Segment};
use crate::observability::metrics::Metrics;
use crate::store::PresenceStore;

struct Session {
    user_id: String,
    segment: Segment,
    position: GeoPoint,
    written: bool,
    hooked: bool,
}

#[derive(Default)]
struct PublisherState {
    session: Option<Session>,
    pending_position: Option<GeoPoint>,
    stale_paths: Vec<String>,
}

/// Owns the local user's live presence record: at most one path across the
/// store, removed on stop and (via the store-side disconnect hook) on crash.
pub struct PresencePublisher {
    inner: Arc<PublisherInner>,
    replay_task: JoinHandle<()>,
}

struct PublisherInner {
    store: Arc<dyn PresenceStore>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    config: Config,
    metrics: Metrics,
    state: Mutex<PublisherState>,
}

impl PresencePublisher {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        config: Config,
        metrics: Metrics,
    ) -> Self {
        let inner = Arc::new(PublisherInner {
            store,
            connectivity,
            config,
            metrics,
            state: Mutex::new(PublisherState::default()),
        });

        let replay_task = tokio::spawn(replay_loop(inner.clone()));

        Self { inner, replay_task }
    }

    pub async fn start(
        &self,
        user_id: &str,
        role: Role,
        destination: Destination,
        initial_position: GeoPoint,
    ) -> Result<(), PresenceError> {
        let mut state = self.inner.state.lock().await;

        if let Some(previous) = state.session.take() {
            let path = previous.segment.record_path(&previous.user_id);
            warn!(path = %path, "start called with an active session; replacing it");
            if previous.written && !self.inner.remove_best_effort(&path).await {
                state.stale_paths.push(path);
            }
        }

        let segment = Segment::new(role, destination);
        if self.inner.connectivity.is_online() {
            self.inner.sweep_stale_records(user_id, segment).await;
        }

        state.session = Some(Session {
            user_id: user_id.to_string(),
            segment,
            position: initial_position,
            written: false,
            hooked: false,
        });

        self.inner.sync_locked(&mut state, true).await
    }

    pub async fn update_position(&self, position: GeoPoint) -> Result<(), PresenceError> {
        let mut state = self.inner.state.lock().await;
        state.pending_position = Some(position);

        if state.session.is_none() {
            debug!("position update queued until start completes");
            return Ok(());
        }

        self.inner.sync_locked(&mut state, false).await
    }

    pub async fn switch_segment(
        &self,
        role: Role,
        destination: Destination,
    ) -> Result<(), PresenceError> {
        let mut state = self.inner.state.lock().await;

        let old_path = {
            let Some(session) = state.session.as_mut() else {
                return Err(PresenceError::NotStarted);
            };
            let new_segment = Segment::new(role, destination);
            if session.segment == new_segment {
                return Ok(());
            }

            let old_path = session.segment.record_path(&session.user_id);
            let was_written = session.written;
            session.segment = new_segment;
            session.written = false;
            session.hooked = false;
            was_written.then_some(old_path)
        };

        // old path goes away before the new record is written, so a reader
        // never sees the user in two segments
        if let Some(path) = old_path {
            if !self.inner.remove_best_effort(&path).await {
                state.stale_paths.push(path);
            }
        }

        self.inner.sync_locked(&mut state, true).await
    }

    pub async fn stop(&self) -> Result<(), PresenceError> {
        let mut state = self.inner.state.lock().await;
        state.pending_position = None;

        let Some(session) = state.session.take() else {
            return Ok(());
        };

        let path = session.segment.record_path(&session.user_id);
        if !session.written {
            let _ = self.inner.store.cancel_on_disconnect(&path).await;
            return Ok(());
        }

        let store = Arc::clone(&self.inner.store);
        let result = self
            .inner
            .retry("remove", &path, || {
                let store = Arc::clone(&store);
                let path = path.clone();
                async move { store.remove(&path).await }
            })
            .await;

        match result {
            Ok(()) => {
                self.inner.count_store_op("remove", "success");
                let _ = self.inner.store.cancel_on_disconnect(&path).await;
                info!(path = %path, "presence record removed");
                Ok(())
            }
            Err(err) => {
                // hook stays registered so the store cleans up the record
                // when this client's connection finally drops
                self.inner.count_store_op("remove", "error");
                error!(path = %path, error = %err, "failed to remove presence record");
                Err(err)
            }
        }
    }

    pub async fn is_started(&self) -> bool {
        self.inner.state.lock().await.session.is_some()
    }
}

impl Drop for PresencePublisher {
    fn drop(&mut self) {
        self.replay_task.abort();
    }
}

async fn replay_loop(inner: Arc<PublisherInner>) {
    let mut rx = inner.connectivity.watch();
    let mut was_online = *rx.borrow();

    // the online edge may have been missed before this task first ran
    if was_online {
        inner.flush_deferred().await;
    }

    while rx.changed().await.is_ok() {
        let online = *rx.borrow();
        if online && !was_online {
            inner.flush_deferred().await;
        }
        was_online = online;
    }
}

impl PublisherInner {
    async fn flush_deferred(&self) {
        let mut state = self.state.lock().await;
        let has_work = state.session.as_ref().is_some_and(|s| !s.written)
            || state.pending_position.is_some()
            || !state.stale_paths.is_empty();
        if !has_work {
            return;
        }

        info!("connectivity regained; replaying deferred presence writes");
        if let Err(err) = self.sync_locked(&mut state, false).await {
            error!(error = %err, "deferred presence replay failed");
        }
    }

    /// Reconciles the store with the desired session. Offline calls return Ok
    /// and are replayed when connectivity comes back; `fatal` write failures
    /// end the session (start/switch), non-fatal ones keep it (updates).
    async fn sync_locked(
        &self,
        state: &mut PublisherState,
        fatal: bool,
    ) -> Result<(), PresenceError> {
        if !self.connectivity.is_online() {
            debug!("offline; presence write deferred");
            return Ok(());
        }

        let stale = std::mem::take(&mut state.stale_paths);
        for path in stale {
            if !self.remove_best_effort(&path).await {
                state.stale_paths.push(path);
            }
        }

        let Some(session) = state.session.as_mut() else {
            return Ok(());
        };
        if let Some(position) = state.pending_position.take() {
            session.position = position;
        }

        let record = PresenceRecord {
            user_id: session.user_id.clone(),
            role: session.segment.role,
            destination: session.segment.destination,
            position: session.position,
            updated_at: Utc::now(),
        };
        let path = record.path();
        let value = serde_json::to_value(&record)
            .map_err(|err| PresenceError::Internal(format!("encode presence record: {err}")))?;

        let store = Arc::clone(&self.store);
        let write = self
            .retry("write", &path, || {
                let store = Arc::clone(&store);
                let path = path.clone();
                let value = value.clone();
                async move { store.write(&path, value).await }
            })
            .await;

        match write {
            Ok(()) => {
                self.count_store_op("write", "success");
                session.written = true;
            }
            Err(err) => {
                self.count_store_op("write", "error");
                if !self.connectivity.is_online() {
                    debug!(path = %path, "went offline mid-write; deferring");
                    return Ok(());
                }
                if fatal {
                    error!(path = %path, error = %err, "presence write failed; session ended");
                    state.session = None;
                } else {
                    warn!(path = %path, error = %err, "presence write failed; will retry");
                }
                return Err(err);
            }
        }

        if !session.hooked {
            match self.store.on_disconnect_remove(&path).await {
                Ok(()) => session.hooked = true,
                Err(err) => warn!(path = %path, error = %err, "disconnect hook not registered"),
            }
        }

        Ok(())
    }

    async fn remove_best_effort(&self, path: &str) -> bool {
        let _ = self.store.cancel_on_disconnect(path).await;

        let store = Arc::clone(&self.store);
        let owned = path.to_string();
        let result = self
            .retry("remove", path, || {
                let store = Arc::clone(&store);
                let path = owned.clone();
                async move { store.remove(&path).await }
            })
            .await;

        match result {
            Ok(()) => {
                self.count_store_op("remove", "success");
                true
            }
            Err(err) => {
                self.count_store_op("remove", "error");
                warn!(path = %path, error = %err, "presence remove failed; will retry later");
                false
            }
        }
    }

    async fn sweep_stale_records(&self, user_id: &str, keep: Segment) {
        for segment in Segment::all() {
            if segment == keep {
                continue;
            }
            let path = segment.record_path(user_id);
            match self.store.snapshot(&path).await {
                Ok(entries) if !entries.is_empty() => {
                    warn!(
                        error = %PresenceError::InvariantViolation(path.clone()),
                        "stale presence record found; forcing removal"
                    );
                    let _ = self.store.remove(&path).await;
                }
                Ok(_) => {}
                Err(err) => debug!(error = %err, "stale record sweep skipped"),
            }
        }
    }

    async fn retry<F, Fut>(&self, what: &str, path: &str, mut op: F) -> Result<(), PresenceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), PresenceError>>,
    {
        let mut delay = self.config.backoff_base();
        let mut last = PresenceError::TransientIo(format!("store {what} at {path} failed"));

        for attempt in 1..=self.config.write_retry_attempts.max(1) {
            match timeout(self.config.store_timeout(), op()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) if err.is_transient() => last = err,
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    last = PresenceError::TransientIo(format!("store {what} at {path} timed out"))
                }
            }

            if !self.connectivity.is_online() {
                break;
            }

            if attempt < self.config.write_retry_attempts {
                warn!(attempt, path = %path, error = %last, "store {what} failed; backing off");
                sleep(delay).await;
                delay *= 2;
            }
        }

        Err(last)
    }

    fn count_store_op(&self, op: &str, outcome: &str) {
        self.metrics
            .presence_writes_total
            .with_label_values(&[op, outcome])
            .inc();
    }
}
