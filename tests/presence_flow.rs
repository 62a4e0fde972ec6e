use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use presence_radar::city::filter::{CityOverviewFilter, OverviewStatus};
use presence_radar::city::resolver::{CityResolver, Geocoder, GeocodedCity};
use presence_radar::config::Config;
use presence_radar::connectivity::SharedConnectivity;
use presence_radar::discovery::{PeerEvent, PresenceDiscovery};
use presence_radar::error::PresenceError;
use presence_radar::models::city::CityBounds;
use presence_radar::models::presence::{Destination, GeoPoint, PresenceRecord, Role, Segment};
use presence_radar::observability::metrics::Metrics;
use presence_radar::proximity::ProximityNotificationEngine;
use presence_radar::publisher::PresencePublisher;
use presence_radar::store::PresenceStore;
use presence_radar::store::memory::MemoryStore;
use tokio_stream::StreamExt;

const METERS_PER_DEGREE: f64 = 111_194.93;

fn meters_north(meters: f64) -> GeoPoint {
    GeoPoint {
        lat: meters / METERS_PER_DEGREE,
        lng: 0.0,
    }
}

struct OriginCityGeocoder {
    calls: AtomicU32,
}

#[async_trait]
impl Geocoder for OriginCityGeocoder {
    async fn reverse_geocode(&self, _lat: f64, _lng: f64) -> Result<GeocodedCity, PresenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GeocodedCity {
            city_name: "Origin City".to_string(),
            bounds: CityBounds {
                north: 0.1,
                south: -0.1,
                east: 0.1,
                west: -0.1,
            },
        })
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    connectivity: Arc<SharedConnectivity>,
    config: Config,
    metrics: Metrics,
}

fn fixture() -> Fixture {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    Fixture {
        store: Arc::new(MemoryStore::new(64)),
        connectivity: Arc::new(SharedConnectivity::new(true)),
        config: Config {
            write_backoff_base_ms: 10,
            ..Config::default()
        },
        metrics: Metrics::new(),
    }
}

impl Fixture {
    fn publisher(&self) -> PresencePublisher {
        PresencePublisher::new(
            self.store.clone(),
            self.connectivity.clone(),
            self.config.clone(),
            self.metrics.clone(),
        )
    }

    fn discovery(&self, local_user_id: &str) -> PresenceDiscovery {
        PresenceDiscovery::new(
            self.store.clone(),
            self.connectivity.clone(),
            local_user_id,
            64,
        )
    }
}

#[tokio::test]
async fn published_presence_reaches_observers_and_alerts() {
    let fx = fixture();

    // the passenger observes drivers heading to town
    let discovery = fx.discovery("pia");
    let mut handle = discovery.observe(Role::Driver, Destination::Town).await.unwrap();

    let engine = ProximityNotificationEngine::new(fx.config.clone(), fx.metrics.clone());
    let mut alerts = engine.subscribe_alerts();
    engine.update_self_position(meters_north(0.0)).await;

    // a driver comes online far away
    let driver = fx.publisher();
    driver
        .start("dana", Role::Driver, Destination::Town, meters_north(2000.0))
        .await
        .unwrap();

    let event = handle.events.next().await.unwrap();
    let PeerEvent::Added(record) = &event else {
        panic!("expected added event, got {event:?}");
    };
    assert_eq!(record.user_id, "dana");
    engine.handle_peer_event(event).await;
    assert!(alerts.try_recv().is_err(), "no alert at 2 km");

    // the driver approaches within the 500 m radius
    driver.update_position(meters_north(400.0)).await.unwrap();

    let event = handle.events.next().await.unwrap();
    assert!(matches!(event, PeerEvent::Updated(_)));
    engine.handle_peer_event(event).await;

    let alert = alerts.recv().await.unwrap();
    assert_eq!(alert.target_user_id, "dana");
    assert_eq!(alert.target_role, Role::Driver);
    assert_eq!(alert.destination, Destination::Town);
    assert!((alert.distance_meters - 400.0).abs() < 5.0);

    // the approach alerts exactly once
    driver.update_position(meters_north(380.0)).await.unwrap();
    let event = handle.events.next().await.unwrap();
    engine.handle_peer_event(event).await;
    assert!(alerts.try_recv().is_err());

    let encoded = fx.metrics.encode().unwrap();
    assert!(encoded.contains("proximity_alerts_total"));
}

#[tokio::test]
async fn segment_switch_moves_the_driver_between_observers() {
    let fx = fixture();

    let discovery = fx.discovery("pia");
    let mut town = discovery.observe(Role::Driver, Destination::Town).await.unwrap();
    let mut local = discovery.observe(Role::Driver, Destination::Local).await.unwrap();

    let driver = fx.publisher();
    driver
        .start("dana", Role::Driver, Destination::Town, meters_north(100.0))
        .await
        .unwrap();
    assert_eq!(town.events.next().await.unwrap().user_id(), "dana");

    driver.switch_segment(Role::Driver, Destination::Local).await.unwrap();

    assert!(matches!(
        town.events.next().await.unwrap(),
        PeerEvent::Removed { user_id } if user_id == "dana"
    ));
    assert!(matches!(
        local.events.next().await.unwrap(),
        PeerEvent::Added(r) if r.user_id == "dana"
    ));

    // the store never held more than one record for the user
    let mut live = 0;
    for segment in Segment::all() {
        live += fx.store.snapshot(&segment.path_prefix()).await.unwrap().len();
    }
    assert_eq!(live, 1);
}

#[tokio::test]
async fn connection_drop_cleans_up_presence_for_observers() {
    let fx = fixture();

    let discovery = fx.discovery("pia");
    let mut handle = discovery.observe(Role::Driver, Destination::Town).await.unwrap();

    let driver = fx.publisher();
    driver
        .start("dana", Role::Driver, Destination::Town, meters_north(100.0))
        .await
        .unwrap();
    assert_eq!(handle.events.next().await.unwrap().user_id(), "dana");

    // the driver's app dies without calling stop; the store-side hook fires
    fx.store.trigger_disconnect().await;

    assert!(matches!(
        handle.events.next().await.unwrap(),
        PeerEvent::Removed { user_id } if user_id == "dana"
    ));
    assert!(fx.store.is_empty());
}

#[tokio::test]
async fn city_overview_scopes_the_discovered_peers() {
    let fx = fixture();

    let discovery = fx.discovery("pia");
    let mut handle = discovery.observe(Role::Driver, Destination::Town).await.unwrap();

    // two drivers inside the city, one far outside
    for (user_id, meters) in [("near1", 400.0), ("near2", 9_000.0), ("far", 400_000.0)] {
        let driver = fx.publisher();
        driver
            .start(user_id, Role::Driver, Destination::Town, meters_north(meters))
            .await
            .unwrap();
    }

    let mut view: Vec<PresenceRecord> = Vec::new();
    for _ in 0..3 {
        match handle.events.next().await.unwrap() {
            PeerEvent::Added(record) => view.push(record),
            other => panic!("expected added event, got {other:?}"),
        }
    }

    let geocoder = Arc::new(OriginCityGeocoder { calls: AtomicU32::new(0) });
    let resolver = Arc::new(CityResolver::new(
        geocoder.clone(),
        fx.config.clone(),
        fx.metrics.clone(),
    ));
    let filter = CityOverviewFilter::new(resolver, true);

    let result = filter
        .filter(
            &view,
            Some(&meters_north(0.0)),
            Role::Passenger,
            Destination::Town,
            true,
        )
        .await;

    assert_eq!(result.total_drivers, 2);
    assert!(result.peers.iter().all(|p| p.user_id.starts_with("near")));
    assert!(matches!(result.overview, OverviewStatus::Applied(_)));

    // the same quantized position resolves from cache
    let again = filter
        .filter(
            &view,
            Some(&meters_north(5.0)),
            Role::Passenger,
            Destination::Town,
            true,
        )
        .await;
    assert!(matches!(again.overview, OverviewStatus::Applied(_)));
    assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
}
