use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum PresenceError {
    #[error("transient i/o: {0}")]
    TransientIo(String),

    #[error("geocoder rate limited")]
    RateLimited,

    #[error("no city found for coordinate")]
    CityNotFound,

    #[error("network error: {0}")]
    Network(String),

    #[error("no position source available")]
    PermissionUnavailable,

    #[error("presence invariant violated: {0}")]
    InvariantViolation(String),

    #[error("publisher has no active session")]
    NotStarted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl PresenceError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PresenceError::TransientIo(_) | PresenceError::Network(_)
        )
    }
}
