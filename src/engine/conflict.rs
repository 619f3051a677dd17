use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Build a span from raw request times, rejecting inverted, out-of-range and
/// over-long windows.
pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::InvalidWindow);
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_RESERVATION_DURATION_MS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(span)
}

/// Same as `validate_window` but with the wider bound used by read queries.
pub(crate) fn validate_query_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::InvalidWindow);
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(span)
}

/// Ids of occupying reservations on this room overlapping `span`.
pub(crate) fn overlapping(rs: &RoomState, span: &Span, exclude: Option<Ulid>) -> Vec<Ulid> {
    rs.overlapping(span)
        .filter(|i| Some(i.id) != exclude)
        .map(|i| i.id)
        .collect()
}

pub(crate) fn check_no_conflict(
    rs: &RoomState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    if let Some(interval) = rs
        .overlapping(span)
        .find(|i| Some(i.id) != exclude)
    {
        metrics::counter!(crate::observability::WINDOW_CONFLICTS_TOTAL).increment(1);
        return Err(EngineError::WindowConflict(interval.id));
    }
    Ok(())
}
