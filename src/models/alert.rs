use serde::{Deserialize, Serialize};

use crate::models::presence::{Destination, Role};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityAlert {
    pub target_user_id: String,
    pub target_role: Role,
    pub distance_meters: f64,
    pub destination: Destination,
}
