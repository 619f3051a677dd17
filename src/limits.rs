use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_CLIENTS: usize = 1_000_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_DESCRIPTION_LEN: usize = 255;

/// 1970-01-01 through 9999-12-31.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_800_000;

/// A single reservation may not hold a room for longer than this.
pub const MAX_RESERVATION_DURATION_MS: Ms = 31 * DAY_MS;

/// Widest window accepted by availability queries.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

/// Occupying reservations per room.
pub const MAX_INTERVALS_PER_ROOM: usize = 100_000;

/// Concurrent mirror calls issued after a sweep batch.
pub const MIRROR_FANOUT: usize = 8;
