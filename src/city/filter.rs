use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::city::resolver::CityResolver;
use crate::error::PresenceError;
use crate::models::city::CityInfo;
use crate::models::presence::{Destination, GeoPoint, PresenceRecord, Role};

#[derive(Debug, Clone, PartialEq)]
pub enum OverviewStatus {
    /// Peers were restricted to the resolved city.
    Applied(CityInfo),
    /// City overview is switched off; peers pass through.
    Off,
    /// City detection failed; peers pass through unfiltered.
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct FilteredPeerSet {
    pub peers: Vec<PresenceRecord>,
    pub total_passengers: usize,
    pub total_drivers: usize,
    pub overview: OverviewStatus,
}

/// Narrows a peer view to the local user's city and visibility settings.
/// Never hides everything: if city detection fails, the visibility-adjusted
/// set passes through with `OverviewStatus::Unavailable`.
pub struct CityOverviewFilter {
    resolver: Arc<CityResolver>,
    enabled: AtomicBool,
}

impl CityOverviewFilter {
    pub fn new(resolver: Arc<CityResolver>, enabled: bool) -> Self {
        Self {
            resolver,
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub async fn filter(
        &self,
        peers: &[PresenceRecord],
        self_position: Option<&GeoPoint>,
        self_role: Role,
        destination: Destination,
        show_same_role: bool,
    ) -> FilteredPeerSet {
        let visible: Vec<PresenceRecord> = peers
            .iter()
            .filter(|peer| peer.destination == destination)
            .filter(|peer| show_same_role || peer.role != self_role)
            .cloned()
            .collect();

        if !self.is_enabled() {
            return finish(visible, OverviewStatus::Off);
        }

        match self.resolve(self_position).await {
            Ok(city) => {
                let inside: Vec<PresenceRecord> = visible
                    .into_iter()
                    .filter(|peer| city.bounds.contains(&peer.position))
                    .collect();
                debug!(city = %city.city_name, peers = inside.len(), "city overview applied");
                finish(inside, OverviewStatus::Applied(city))
            }
            Err(err) => {
                warn!(error = %err, "city overview unavailable; showing unfiltered peers");
                finish(visible, OverviewStatus::Unavailable)
            }
        }
    }

    async fn resolve(&self, self_position: Option<&GeoPoint>) -> Result<CityInfo, PresenceError> {
        let position = self_position.ok_or(PresenceError::PermissionUnavailable)?;
        self.resolver.resolve_city(position).await
    }
}

fn finish(peers: Vec<PresenceRecord>, overview: OverviewStatus) -> FilteredPeerSet {
    let total_passengers = peers.iter().filter(|p| p.role == Role::Passenger).count();
    let total_drivers = peers.iter().filter(|p| p.role == Role::Driver).count();

    FilteredPeerSet {
        peers,
        total_passengers,
        total_drivers,
        overview,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use super::{CityOverviewFilter, OverviewStatus};
    use crate::city::resolver::{CityResolver, Geocoder, GeocodedCity};
    use crate::config::Config;
    use crate::error::PresenceError;
    use crate::models::city::CityBounds;
    use crate::models::presence::{Destination, GeoPoint, PresenceRecord, Role};
    use crate::observability::metrics::Metrics;

    // city box around (53.55, 9.99)
    struct BoxGeocoder {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Geocoder for BoxGeocoder {
        async fn reverse_geocode(
            &self,
            _lat: f64,
            _lng: f64,
        ) -> Result<GeocodedCity, PresenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(GeocodedCity {
                city_name: "Hamburg".to_string(),
                bounds: CityBounds {
                    north: 53.7,
                    south: 53.4,
                    east: 10.3,
                    west: 9.7,
                },
            })
        }
    }

    struct FailingGeocoder;

    #[async_trait]
    impl Geocoder for FailingGeocoder {
        async fn reverse_geocode(
            &self,
            _lat: f64,
            _lng: f64,
        ) -> Result<GeocodedCity, PresenceError> {
            Err(PresenceError::CityNotFound)
        }
    }

    fn peer(user_id: &str, role: Role, lat: f64, lng: f64) -> PresenceRecord {
        PresenceRecord {
            user_id: user_id.to_string(),
            role,
            destination: Destination::Town,
            position: GeoPoint { lat, lng },
            updated_at: Utc::now(),
        }
    }

    fn filter_with(geocoder: Arc<dyn Geocoder>, enabled: bool) -> CityOverviewFilter {
        let resolver = Arc::new(CityResolver::new(geocoder, Config::default(), Metrics::new()));
        CityOverviewFilter::new(resolver, enabled)
    }

    fn self_position() -> GeoPoint {
        GeoPoint { lat: 53.55, lng: 9.99 }
    }

    #[tokio::test]
    async fn peers_outside_the_city_are_dropped() {
        let filter = filter_with(Arc::new(BoxGeocoder { calls: AtomicU32::new(0) }), true);

        let peers = vec![
            peer("d1", Role::Driver, 53.55, 9.99),
            peer("d2", Role::Driver, 53.56, 10.00),
            peer("d3", Role::Driver, 53.45, 9.80),
            peer("d4", Role::Driver, 48.85, 2.35),
            peer("d5", Role::Driver, 52.52, 13.40),
        ];

        let result = filter
            .filter(
                &peers,
                Some(&self_position()),
                Role::Passenger,
                Destination::Town,
                true,
            )
            .await;

        assert_eq!(result.peers.len(), 3);
        assert_eq!(result.total_drivers, 3);
        assert_eq!(result.total_passengers, 0);
        assert!(matches!(result.overview, OverviewStatus::Applied(_)));
    }

    #[tokio::test]
    async fn same_role_peers_are_hidden_when_flag_is_off() {
        let filter = filter_with(Arc::new(BoxGeocoder { calls: AtomicU32::new(0) }), true);

        let peers = vec![
            peer("p1", Role::Passenger, 53.55, 9.99),
            peer("p2", Role::Passenger, 53.56, 9.98),
            peer("d1", Role::Driver, 53.55, 9.99),
            peer("d2", Role::Driver, 53.56, 10.00),
            peer("d3", Role::Driver, 53.57, 9.95),
        ];

        let result = filter
            .filter(
                &peers,
                Some(&self_position()),
                Role::Passenger,
                Destination::Town,
                false,
            )
            .await;

        assert_eq!(result.total_drivers, 3);
        assert_eq!(result.total_passengers, 0);
        assert!(result.peers.iter().all(|p| p.role == Role::Driver));
    }

    #[tokio::test]
    async fn disabled_overview_skips_geocoding_entirely() {
        let geocoder = Arc::new(BoxGeocoder { calls: AtomicU32::new(0) });
        let filter = filter_with(geocoder.clone(), false);

        let peers = vec![
            peer("d1", Role::Driver, 53.55, 9.99),
            peer("d2", Role::Driver, 48.85, 2.35),
        ];

        let result = filter
            .filter(
                &peers,
                Some(&self_position()),
                Role::Passenger,
                Destination::Town,
                true,
            )
            .await;

        assert_eq!(result.peers.len(), 2, "no city restriction when off");
        assert_eq!(result.overview, OverviewStatus::Off);
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resolver_failure_falls_back_to_unfiltered_peers() {
        let filter = filter_with(Arc::new(FailingGeocoder), true);

        let peers = vec![
            peer("d1", Role::Driver, 53.55, 9.99),
            peer("d2", Role::Driver, 48.85, 2.35),
        ];

        let result = filter
            .filter(
                &peers,
                Some(&self_position()),
                Role::Passenger,
                Destination::Town,
                true,
            )
            .await;

        assert_eq!(result.peers.len(), 2);
        assert_eq!(result.overview, OverviewStatus::Unavailable);
    }

    #[tokio::test]
    async fn missing_self_position_degrades_like_a_resolver_failure() {
        let geocoder = Arc::new(BoxGeocoder { calls: AtomicU32::new(0) });
        let filter = filter_with(geocoder.clone(), true);

        let peers = vec![peer("d1", Role::Driver, 53.55, 9.99)];
        let result = filter
            .filter(&peers, None, Role::Passenger, Destination::Town, true)
            .await;

        assert_eq!(result.peers.len(), 1);
        assert_eq!(result.overview, OverviewStatus::Unavailable);
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn foreign_destination_records_are_revalidated_out() {
        let filter = filter_with(Arc::new(BoxGeocoder { calls: AtomicU32::new(0) }), true);

        let mut stray = peer("d9", Role::Driver, 53.55, 9.99);
        stray.destination = Destination::Local;
        let peers = vec![peer("d1", Role::Driver, 53.55, 9.99), stray];

        let result = filter
            .filter(
                &peers,
                Some(&self_position()),
                Role::Passenger,
                Destination::Town,
                true,
            )
            .await;

        assert_eq!(result.peers.len(), 1);
        assert_eq!(result.peers[0].user_id, "d1");
    }
}
