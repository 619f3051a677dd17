use ulid::Ulid;

use crate::model::{Ms, ReservationStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed input, e.g. a missing required attribute.
    Validation(&'static str),
    /// `end <= start`.
    InvalidWindow,
    /// Start is earlier than the earliest allowed start.
    LeadTimeViolation { earliest: Ms },
    /// Window overlaps this occupying reservation.
    WindowConflict(Ulid),
    RoomNotFound(Ulid),
    ClientNotFound(Ulid),
    ReservationNotFound(Ulid),
    AlreadyExists(Ulid),
    Forbidden(&'static str),
    NotCancelable(&'static str),
    NotModifiable(Ulid),
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    RoomHasActiveReservations(Ulid),
    LimitExceeded(&'static str),
    Timeout(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation error: {msg}"),
            EngineError::InvalidWindow => write!(f, "end must be after start"),
            EngineError::LeadTimeViolation { earliest } => {
                write!(f, "reservation must start at or after {earliest}")
            }
            EngineError::WindowConflict(id) => {
                write!(f, "window overlaps reservation: {id}")
            }
            EngineError::RoomNotFound(id) => write!(f, "room not found: {id}"),
            EngineError::ClientNotFound(id) => write!(f, "client not found: {id}"),
            EngineError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::NotCancelable(msg) => write!(f, "not cancelable: {msg}"),
            EngineError::NotModifiable(id) => {
                write!(f, "reservation {id} is closed and cannot be modified")
            }
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "reservation {id}: cannot move from {from} to {to}")
            }
            EngineError::RoomHasActiveReservations(id) => {
                write!(f, "cannot remove room {id}: it has active reservations")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Timeout(op) => write!(f, "timed out: {op}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
