use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Rooms ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomSize {
    Small,
    Medium,
    Large,
}

impl RoomSize {
    /// Maximum number of people the room holds. Capacity always follows the size.
    pub fn capacity(self) -> u32 {
        match self {
            RoomSize::Small => 10,
            RoomSize::Medium => 25,
            RoomSize::Large => 40,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub number: u32,
    pub size: RoomSize,
    pub capacity: u32,
    pub description: Option<String>,
    /// Soft-delete flag. A removed room keeps its record so reservation
    /// history can still reference it, but it is invisible to normal lookups.
    pub removed: bool,
}

/// Attributes supplied when creating or updating a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSpec {
    pub number: u32,
    pub size: RoomSize,
    pub description: Option<String>,
}

// ── Clients and actors ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: Ulid,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Staff,
}

/// Already-authenticated caller, resolved by the identity layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn client(id: Ulid) -> Self {
        Self { id, role: Role::Client }
    }

    pub fn staff(id: Ulid) -> Self {
        Self { id, role: Role::Staff }
    }

    pub fn is_staff(&self) -> bool {
        self.role == Role::Staff
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    Cash,
    Transfer,
    Card,
    MercadoPago,
}

impl PaymentMethod {
    /// Online payments are confirmed later by the payment provider.
    pub fn requires_confirmation(self) -> bool {
        matches!(self, PaymentMethod::MercadoPago)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Active,
    PendingPaymentConfirmation,
    Cancelled,
    Finalized,
}

impl ReservationStatus {
    /// Occupying states count toward room conflicts and availability.
    pub fn is_occupying(self) -> bool {
        matches!(
            self,
            ReservationStatus::Active | ReservationStatus::PendingPaymentConfirmation
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ReservationStatus::Cancelled | ReservationStatus::Finalized)
    }

    /// The only legal edges of the lifecycle. Terminal states have none.
    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (PendingPaymentConfirmation, Active)
                | (PendingPaymentConfirmation, Cancelled)
                | (Active, Cancelled)
                | (Active, Finalized)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Active => "ACTIVE",
            ReservationStatus::PendingPaymentConfirmation => "PENDING_PAYMENT_CONFIRMATION",
            ReservationStatus::Cancelled => "CANCELLED",
            ReservationStatus::Finalized => "FINALIZED",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub client_id: Ulid,
    pub room_id: Ulid,
    pub span: Span,
    pub status: ReservationStatus,
    pub payment_method: PaymentMethod,
    pub amount: Option<Decimal>,
    /// Key of the mirrored calendar event, once the mirror call succeeded.
    pub mirror_key: Option<String>,
    pub created_at: Ms,
    /// Set only while awaiting payment confirmation.
    pub payment_deadline: Option<Ms>,
    /// When the reservation reached a terminal state.
    pub closed_at: Option<Ms>,
}

/// A creation request. Times are raw so an inverted window can be rejected
/// before a `Span` is ever built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub client_id: Ulid,
    pub room_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub payment_method: PaymentMethod,
    pub amount: Option<Decimal>,
}

/// Replacement values for a modification. The reservation keeps its id,
/// owner, status and mirror key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationChanges {
    pub room_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub payment_method: PaymentMethod,
    pub amount: Option<Decimal>,
}

// ── Per-room conflict index ──────────────────────────────────────

/// An occupying reservation as seen by the room's conflict index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
}

impl Interval {
    /// `None` for reservations that no longer occupy the room.
    pub fn for_reservation(r: &Reservation) -> Option<Self> {
        r.status.is_occupying().then_some(Self {
            id: r.id,
            span: r.span,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Occupying reservations only, sorted by `span.start`.
    pub intervals: Vec<Interval>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            intervals: Vec::new(),
        }
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// Return only intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }

    pub fn is_occupied(&self) -> bool {
        !self.intervals.is_empty()
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// Flat event records. This is the WAL format; every state change is one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ClientRegistered {
        id: Ulid,
        name: String,
        email: String,
    },
    RoomCreated {
        id: Ulid,
        number: u32,
        size: RoomSize,
        description: Option<String>,
    },
    RoomUpdated {
        id: Ulid,
        number: u32,
        size: RoomSize,
        description: Option<String>,
    },
    RoomRemoved {
        id: Ulid,
    },
    ReservationPlaced {
        reservation: Reservation,
    },
    ReservationRescheduled {
        id: Ulid,
        room_id: Ulid,
        span: Span,
        payment_method: PaymentMethod,
        amount: Option<Decimal>,
    },
    MirrorKeyAssigned {
        id: Ulid,
        key: String,
    },
    PaymentConfirmed {
        id: Ulid,
        at: Ms,
    },
    ReservationCancelled {
        id: Ulid,
        at: Ms,
    },
    /// Sweep batch: every listed ACTIVE reservation becomes FINALIZED.
    ReservationsFinalized {
        ids: Vec<Ulid>,
        at: Ms,
    },
    /// Sweep batch: every listed pending reservation is cancelled for lack of payment.
    PaymentsExpired {
        ids: Vec<Ulid>,
        at: Ms,
    },
}
