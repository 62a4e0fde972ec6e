use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::presence::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CityBounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl CityBounds {
    pub fn contains(&self, point: &GeoPoint) -> bool {
        point.lat <= self.north
            && point.lat >= self.south
            && point.lng <= self.east
            && point.lng >= self.west
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityInfo {
    pub city_name: String,
    pub bounds: CityBounds,
    pub resolved_at: DateTime<Utc>,
}
