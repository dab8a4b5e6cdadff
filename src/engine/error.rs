use ulid::Ulid;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// The requested interval overlaps a confirmed booking. Expected under load.
    #[error("conflict with booking: {0}")]
    Conflict(Ulid),
    #[error("staff member {0} still has upcoming bookings")]
    HasBookings(Ulid),
    #[error("invalid input: {0}")]
    Invalid(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}
