use std::collections::HashMap;

use tokio::sync::{Mutex, broadcast};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discovery::PeerEvent;
use crate::geo::haversine_m;
use crate::models::alert::ProximityAlert;
use crate::models::presence::{GeoPoint, PresenceRecord};
use crate::observability::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPhase {
    Idle,
    Armed,
    Cooldown,
}

#[derive(Debug, Clone)]
struct TargetState {
    record: PresenceRecord,
    phase: TargetPhase,
    last_distance_m: Option<f64>,
    left_hysteresis_band: bool,
    last_alert_at: Option<Instant>,
}

impl TargetState {
    fn fresh(record: PresenceRecord) -> Self {
        Self {
            record,
            phase: TargetPhase::Idle,
            last_distance_m: None,
            left_hysteresis_band: false,
            last_alert_at: None,
        }
    }
}

struct EngineState {
    enabled: bool,
    self_position: Option<GeoPoint>,
    alert_radius_m: f64,
    targets: HashMap<String, TargetState>,
}

/// Emits one alert per qualifying approach for every tracked peer. Alerts go
/// out on a broadcast channel; the delivery layer subscribes.
pub struct ProximityNotificationEngine {
    config: Config,
    metrics: Metrics,
    state: Mutex<EngineState>,
    alerts_tx: broadcast::Sender<ProximityAlert>,
}

impl ProximityNotificationEngine {
    pub fn new(config: Config, metrics: Metrics) -> Self {
        let (alerts_tx, _rx) = broadcast::channel(config.event_buffer_size.max(1));
        let state = EngineState {
            enabled: config.alerts_enabled,
            self_position: None,
            alert_radius_m: config.alert_radius_m,
            targets: HashMap::new(),
        };

        Self {
            config,
            metrics,
            state: Mutex::new(state),
            alerts_tx,
        }
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<ProximityAlert> {
        self.alerts_tx.subscribe()
    }

    pub async fn set_alert_radius(&self, radius_m: f64) {
        let mut state = self.state.lock().await;
        state.alert_radius_m = radius_m.max(0.0);
        self.evaluate_all(&mut state);
    }

    pub async fn update_self_position(&self, position: GeoPoint) {
        let mut state = self.state.lock().await;
        state.self_position = Some(position);
        if state.enabled {
            self.evaluate_all(&mut state);
        }
    }

    pub async fn handle_peer_event(&self, event: PeerEvent) {
        let mut state = self.state.lock().await;
        if !state.enabled {
            return;
        }

        match event {
            PeerEvent::Added(record) => {
                // a rejoin starts a new lifecycle; any previous state is gone
                let user_id = record.user_id.clone();
                state.targets.insert(user_id.clone(), TargetState::fresh(record));
                self.evaluate_one(&mut state, &user_id);
            }
            PeerEvent::Updated(record) => {
                let user_id = record.user_id.clone();
                match state.targets.get_mut(&user_id) {
                    Some(target) => target.record = record,
                    None => {
                        debug!(user_id = %user_id, "update for untracked peer; tracking fresh");
                        state.targets.insert(user_id.clone(), TargetState::fresh(record));
                    }
                }
                self.evaluate_one(&mut state, &user_id);
            }
            PeerEvent::Removed { user_id } => {
                state.targets.remove(&user_id);
            }
        }

        self.metrics.peers_tracked.set(state.targets.len() as i64);
    }

    pub async fn disable(&self) {
        let mut state = self.state.lock().await;
        if !state.enabled {
            return;
        }
        state.enabled = false;
        state.targets.clear();
        self.metrics.peers_tracked.set(0);
        info!("proximity alerts disabled; tracking state cleared");
    }

    /// Re-enables tracking from scratch: every currently visible peer starts
    /// at idle regardless of any history before the disable.
    pub async fn enable(&self, current_peers: impl IntoIterator<Item = PresenceRecord>) {
        let mut state = self.state.lock().await;
        state.enabled = true;
        state.targets = current_peers
            .into_iter()
            .map(|record| (record.user_id.clone(), TargetState::fresh(record)))
            .collect();
        self.metrics.peers_tracked.set(state.targets.len() as i64);
        info!(peers = state.targets.len(), "proximity alerts enabled");

        self.evaluate_all(&mut state);
    }

    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.enabled
    }

    pub async fn phase_of(&self, user_id: &str) -> Option<TargetPhase> {
        let state = self.state.lock().await;
        state.targets.get(user_id).map(|target| target.phase)
    }

    pub async fn distance_to(&self, user_id: &str) -> Option<f64> {
        let state = self.state.lock().await;
        state.targets.get(user_id).and_then(|target| target.last_distance_m)
    }

    fn evaluate_all(&self, state: &mut EngineState) {
        let user_ids: Vec<String> = state.targets.keys().cloned().collect();
        for user_id in user_ids {
            self.evaluate_one(state, &user_id);
        }
    }

    fn evaluate_one(&self, state: &mut EngineState, user_id: &str) {
        let Some(self_position) = state.self_position else {
            return;
        };
        let radius = state.alert_radius_m;
        let Some(target) = state.targets.get_mut(user_id) else {
            return;
        };

        let fired = evaluate(
            target,
            &self_position,
            radius,
            self.config.hysteresis_margin_m,
            self.config.cooldown_min(),
            self.config.cooldown_max(),
            Instant::now(),
        );

        if fired {
            let distance = target.last_distance_m.unwrap_or(0.0);
            let alert = ProximityAlert {
                target_user_id: target.record.user_id.clone(),
                target_role: target.record.role,
                distance_meters: distance,
                destination: target.record.destination,
            };

            self.metrics.proximity_alerts_total.inc();
            info!(
                target = %alert.target_user_id,
                distance_m = alert.distance_meters,
                "proximity alert"
            );

            if self.alerts_tx.send(alert).is_err() {
                warn!("proximity alert dropped: no delivery subscriber");
            }
        }
    }
}

/// One evaluation step for a single target. Returns true when an alert fires.
///
/// Entry requires crossing inward past `radius`; re-arming out of cooldown
/// requires the minimum wait plus one excursion beyond `radius + margin`
/// (hysteresis), or the maximum wait on its own.
fn evaluate(
    target: &mut TargetState,
    self_position: &GeoPoint,
    radius_m: f64,
    margin_m: f64,
    cooldown_min: Duration,
    cooldown_max: Duration,
    now: Instant,
) -> bool {
    let distance = haversine_m(self_position, &target.record.position);
    target.last_distance_m = Some(distance);

    loop {
        match target.phase {
            TargetPhase::Idle => {
                if distance <= radius_m {
                    target.phase = TargetPhase::Armed;
                    continue;
                }
                return false;
            }
            TargetPhase::Armed => {
                if distance <= radius_m {
                    target.phase = TargetPhase::Cooldown;
                    target.last_alert_at = Some(now);
                    target.left_hysteresis_band = false;
                    return true;
                }
                target.phase = TargetPhase::Idle;
                return false;
            }
            TargetPhase::Cooldown => {
                if distance > radius_m + margin_m {
                    target.left_hysteresis_band = true;
                }

                let Some(alerted_at) = target.last_alert_at else {
                    target.phase = TargetPhase::Idle;
                    return false;
                };
                let elapsed = now.duration_since(alerted_at);
                if elapsed >= cooldown_max
                    || (elapsed >= cooldown_min && target.left_hysteresis_band)
                {
                    target.phase = TargetPhase::Armed;
                    continue;
                }
                return false;
            }
        }
    }
}
