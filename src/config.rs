use std::env;
use std::time::Duration;

use crate::error::PresenceError;

#[derive(Debug, Clone)]
pub struct Config {
    pub alert_radius_m: f64,
    pub hysteresis_margin_m: f64,
    pub cooldown_min_secs: u64,
    pub cooldown_max_secs: u64,
    pub alerts_enabled: bool,
    pub city_overview_enabled: bool,
    pub city_cache_capacity: usize,
    pub city_cache_ttl_secs: u64,
    pub geocoder_timeout_secs: u64,
    pub geocoder_rate_capacity: u32,
    pub geocoder_rate_refill_per_sec: f64,
    pub store_timeout_secs: u64,
    pub write_retry_attempts: u32,
    pub write_backoff_base_ms: u64,
    pub event_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alert_radius_m: 500.0,
            hysteresis_margin_m: 50.0,
            cooldown_min_secs: 60,
            cooldown_max_secs: 600,
            alerts_enabled: true,
            city_overview_enabled: true,
            city_cache_capacity: 128,
            city_cache_ttl_secs: 3600,
            geocoder_timeout_secs: 10,
            geocoder_rate_capacity: 10,
            geocoder_rate_refill_per_sec: 1.0,
            store_timeout_secs: 10,
            write_retry_attempts: 3,
            write_backoff_base_ms: 200,
            event_buffer_size: 1024,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, PresenceError> {
        let _ = dotenvy::dotenv();
        let defaults = Config::default();

        Ok(Self {
            alert_radius_m: parse_or_default("ALERT_RADIUS_M", defaults.alert_radius_m)?,
            hysteresis_margin_m: parse_or_default(
                "HYSTERESIS_MARGIN_M",
                defaults.hysteresis_margin_m,
            )?,
            cooldown_min_secs: parse_or_default("COOLDOWN_MIN_SECS", defaults.cooldown_min_secs)?,
            cooldown_max_secs: parse_or_default("COOLDOWN_MAX_SECS", defaults.cooldown_max_secs)?,
            alerts_enabled: parse_or_default("ALERTS_ENABLED", defaults.alerts_enabled)?,
            city_overview_enabled: parse_or_default(
                "CITY_OVERVIEW_ENABLED",
                defaults.city_overview_enabled,
            )?,
            city_cache_capacity: parse_or_default(
                "CITY_CACHE_CAPACITY",
                defaults.city_cache_capacity,
            )?,
            city_cache_ttl_secs: parse_or_default(
                "CITY_CACHE_TTL_SECS",
                defaults.city_cache_ttl_secs,
            )?,
            geocoder_timeout_secs: parse_or_default(
                "GEOCODER_TIMEOUT_SECS",
                defaults.geocoder_timeout_secs,
            )?,
            geocoder_rate_capacity: parse_or_default(
                "GEOCODER_RATE_CAPACITY",
                defaults.geocoder_rate_capacity,
            )?,
            geocoder_rate_refill_per_sec: parse_or_default(
                "GEOCODER_RATE_REFILL_PER_SEC",
                defaults.geocoder_rate_refill_per_sec,
            )?,
            store_timeout_secs: parse_or_default("STORE_TIMEOUT_SECS", defaults.store_timeout_secs)?,
            write_retry_attempts: parse_or_default(
                "WRITE_RETRY_ATTEMPTS",
                defaults.write_retry_attempts,
            )?,
            write_backoff_base_ms: parse_or_default(
                "WRITE_BACKOFF_BASE_MS",
                defaults.write_backoff_base_ms,
            )?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
        })
    }

    pub fn cooldown_min(&self) -> Duration {
        Duration::from_secs(self.cooldown_min_secs)
    }

    pub fn cooldown_max(&self) -> Duration {
        Duration::from_secs(self.cooldown_max_secs)
    }

    pub fn city_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.city_cache_ttl_secs)
    }

    pub fn geocoder_timeout(&self) -> Duration {
        Duration::from_secs(self.geocoder_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.write_backoff_base_ms)
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, PresenceError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| PresenceError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
