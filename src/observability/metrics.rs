use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub presence_writes_total: IntCounterVec,
    pub geocoder_calls_total: IntCounterVec,
    pub city_cache_lookups_total: IntCounterVec,
    pub proximity_alerts_total: IntCounter,
    pub peers_tracked: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let presence_writes_total = IntCounterVec::new(
            Opts::new("presence_writes_total", "Presence store ops by outcome"),
            &["op", "outcome"],
        )
        .expect("valid presence_writes_total metric");

        let geocoder_calls_total = IntCounterVec::new(
            Opts::new("geocoder_calls_total", "Reverse geocoder calls by outcome"),
            &["outcome"],
        )
        .expect("valid geocoder_calls_total metric");

        let city_cache_lookups_total = IntCounterVec::new(
            Opts::new("city_cache_lookups_total", "City cache lookups by result"),
            &["result"],
        )
        .expect("valid city_cache_lookups_total metric");

        let proximity_alerts_total = IntCounter::new(
            "proximity_alerts_total",
            "Total proximity alerts emitted",
        )
        .expect("valid proximity_alerts_total metric");

        let peers_tracked = IntGauge::new(
            "peers_tracked",
            "Peers currently tracked by the proximity engine",
        )
        .expect("valid peers_tracked metric");

        registry
            .register(Box::new(presence_writes_total.clone()))
            .expect("register presence_writes_total");
        registry
            .register(Box::new(geocoder_calls_total.clone()))
            .expect("register geocoder_calls_total");
        registry
            .register(Box::new(city_cache_lookups_total.clone()))
            .expect("register city_cache_lookups_total");
        registry
            .register(Box::new(proximity_alerts_total.clone()))
            .expect("register proximity_alerts_total");
        registry
            .register(Box::new(peers_tracked.clone()))
            .expect("register peers_tracked");

        Self {
            registry,
            presence_writes_total,
            geocoder_calls_total,
            city_cache_lookups_total,
            proximity_alerts_total,
            peers_tracked,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
