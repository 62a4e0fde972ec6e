use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use tokio::sync::{Mutex, broadcast};
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::PresenceError;
use crate::models::city::{CityBounds, CityInfo};
use crate::models::presence::GeoPoint;
use crate::observability::metrics::Metrics;

#[derive(Debug, Clone)]
pub struct GeocodedCity {
    pub city_name: String,
    pub bounds: CityBounds,
}

/// External reverse-geocoding API. Metered; the resolver rate-limits it.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn reverse_geocode(&self, lat: f64, lng: f64) -> Result<GeocodedCity, PresenceError>;
}

// ~1.1 km grid at the equator, coarse enough to absorb GPS jitter
const CELLS_PER_DEGREE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridKey {
    lat_cell: i32,
    lng_cell: i32,
}

impl GridKey {
    pub fn from_point(point: &GeoPoint) -> Self {
        Self {
            lat_cell: (point.lat * CELLS_PER_DEGREE).round() as i32,
            lng_cell: (point.lng * CELLS_PER_DEGREE).round() as i32,
        }
    }
}

struct CacheEntry {
    info: CityInfo,
    inserted_at: Instant,
}

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

type FlightResult = Result<CityInfo, PresenceError>;

/// Resolves a coordinate to a city with a quantized TTL+LRU cache, a global
/// token-bucket rate limit and per-key singleflight coalescing.
pub struct CityResolver {
    geocoder: Arc<dyn Geocoder>,
    config: Config,
    metrics: Metrics,
    cache: Mutex<LruCache<GridKey, CacheEntry>>,
    bucket: Mutex<TokenBucket>,
    inflight: Mutex<HashMap<GridKey, broadcast::Sender<FlightResult>>>,
}

enum Flight {
    Leader(broadcast::Sender<FlightResult>),
    Follower(broadcast::Receiver<FlightResult>),
}

impl CityResolver {
    pub fn new(geocoder: Arc<dyn Geocoder>, config: Config, metrics: Metrics) -> Self {
        let capacity = NonZeroUsize::new(config.city_cache_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        let bucket = TokenBucket::new(
            config.geocoder_rate_capacity,
            config.geocoder_rate_refill_per_sec,
        );

        Self {
            geocoder,
            config,
            metrics,
            cache: Mutex::new(LruCache::new(capacity)),
            bucket: Mutex::new(bucket),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve_city(&self, position: &GeoPoint) -> Result<CityInfo, PresenceError> {
        let key = GridKey::from_point(position);

        if let Some(info) = self.cache_lookup(&key).await {
            return Ok(info);
        }

        let flight = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&key) {
                Some(tx) => Flight::Follower(tx.subscribe()),
                None => {
                    let (tx, _rx) = broadcast::channel(1);
                    inflight.insert(key, tx.clone());
                    Flight::Leader(tx)
                }
            }
        };

        match flight {
            Flight::Follower(mut rx) => {
                debug!("joining in-flight geocode");
                rx.recv()
                    .await
                    .map_err(|_| PresenceError::Internal("in-flight geocode dropped".to_string()))?
            }
            Flight::Leader(tx) => {
                let result = self.fetch(key, position).await;
                self.inflight.lock().await.remove(&key);
                let _ = tx.send(result.clone());
                result
            }
        }
    }

    async fn cache_lookup(&self, key: &GridKey) -> Option<CityInfo> {
        let mut cache = self.cache.lock().await;
        match cache.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.config.city_cache_ttl() => {
                self.count_lookup("hit");
                Some(entry.info.clone())
            }
            Some(_) => {
                cache.pop(key);
                self.count_lookup("expired");
                None
            }
            None => {
                self.count_lookup("miss");
                None
            }
        }
    }

    async fn fetch(&self, key: GridKey, position: &GeoPoint) -> FlightResult {
        {
            let mut bucket = self.bucket.lock().await;
            if !bucket.try_take() {
                self.count_call("rate_limited");
                warn!("geocoder rate limit exhausted; failing fast");
                return Err(PresenceError::RateLimited);
            }
        }

        let call = self.geocoder.reverse_geocode(position.lat, position.lng);
        let geocoded = match timeout(self.config.geocoder_timeout(), call).await {
            Ok(Ok(city)) => city,
            Ok(Err(err)) => {
                self.count_call(match err {
                    PresenceError::CityNotFound => "not_found",
                    _ => "error",
                });
                return Err(err);
            }
            Err(_) => {
                self.count_call("timeout");
                return Err(PresenceError::Network("reverse geocode timed out".to_string()));
            }
        };

        self.count_call("success");
        let info = CityInfo {
            city_name: geocoded.city_name,
            bounds: geocoded.bounds,
            resolved_at: Utc::now(),
        };

        let mut cache = self.cache.lock().await;
        cache.put(
            key,
            CacheEntry {
                info: info.clone(),
                inserted_at: Instant::now(),
            },
        );

        Ok(info)
    }

    fn count_lookup(&self, result: &str) {
        self.metrics
            .city_cache_lookups_total
            .with_label_values(&[result])
            .inc();
    }

    fn count_call(&self, outcome: &str) {
        self.metrics
            .geocoder_calls_total
            .with_label_values(&[outcome])
            .inc();
    }
}
