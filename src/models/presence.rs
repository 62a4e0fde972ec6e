use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Passenger,
    Driver,
}

impl Role {
    pub fn path_segment(&self) -> &'static str {
        match self {
            Role::Passenger => "passenger",
            Role::Driver => "driver",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    Town,
    Local,
}

impl Destination {
    pub fn path_segment(&self) -> &'static str {
        match self {
            Destination::Town => "town",
            Destination::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Segment {
    pub role: Role,
    pub destination: Destination,
}

impl Segment {
    pub fn new(role: Role, destination: Destination) -> Self {
        Self { role, destination }
    }

    pub fn all() -> [Segment; 4] {
        [
            Segment::new(Role::Passenger, Destination::Town),
            Segment::new(Role::Passenger, Destination::Local),
            Segment::new(Role::Driver, Destination::Town),
            Segment::new(Role::Driver, Destination::Local),
        ]
    }

    pub fn path_prefix(&self) -> String {
        format!(
            "{}/{}",
            self.role.path_segment(),
            self.destination.path_segment()
        )
    }

    pub fn record_path(&self, user_id: &str) -> String {
        format!("{}/{user_id}", self.path_prefix())
    }

    pub fn parse_path(path: &str) -> Option<(Segment, &str)> {
        let mut parts = path.splitn(3, '/');

        let role = match parts.next()? {
            "passenger" => Role::Passenger,
            "driver" => Role::Driver,
            _ => return None,
        };
        let destination = match parts.next()? {
            "town" => Destination::Town,
            "local" => Destination::Local,
            _ => return None,
        };
        let user_id = parts.next()?;
        if user_id.is_empty() {
            return None;
        }

        Some((Segment::new(role, destination), user_id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub role: Role,
    pub destination: Destination,
    pub position: GeoPoint,
    pub updated_at: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn segment(&self) -> Segment {
        Segment::new(self.role, self.destination)
    }

    pub fn path(&self) -> String {
        self.segment().record_path(&self.user_id)
    }
}
