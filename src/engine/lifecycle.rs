use rust_decimal::Decimal;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{info, warn};
use ulid::Ulid;

use crate::clock::minimum_allowed_start;
use crate::limits::MAX_INTERVALS_PER_ROOM;
use crate::mirror::EventDraft;
use crate::model::*;
use crate::observability::{
    LEAD_TIME_VIOLATIONS_TOTAL, RESERVATIONS_CANCELLED_TOTAL, RESERVATIONS_CREATED_TOTAL,
};

use super::conflict::{check_no_conflict, validate_window};
use super::{Engine, EngineError};

/// Title and description of a reservation's calendar event.
fn event_draft(client: &Client, room_number: u32, r: &Reservation) -> EventDraft {
    EventDraft {
        title: format!("Reserva de {}", client.name),
        description: format!("Sala: {room_number}\nEmailCliente: {}", client.email),
        start: r.span.start,
        end: r.span.end,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelledBy {
    Client,
    Staff,
}

impl CancelledBy {
    fn label(self) -> &'static str {
        match self {
            CancelledBy::Client => "client",
            CancelledBy::Staff => "staff",
        }
    }
}

impl Engine {
    fn check_lead_time(&self, span: &Span) -> Result<(), EngineError> {
        let earliest =
            minimum_allowed_start(self.now(), self.policy.timezone, self.policy.min_lead_ms);
        if span.start < earliest {
            metrics::counter!(LEAD_TIME_VIOLATIONS_TOTAL).increment(1);
            return Err(EngineError::LeadTimeViolation { earliest });
        }
        Ok(())
    }

    fn check_amount(amount: Option<Decimal>) -> Result<(), EngineError> {
        if amount.is_some_and(|a| a.is_sign_negative()) {
            return Err(EngineError::Validation("amount must not be negative"));
        }
        Ok(())
    }

    // ── Creation ─────────────────────────────────────────

    /// Book a room. The conflict check and the insert run under the room's
    /// write lock. The calendar event is created after the lock is released;
    /// its failure is logged and does not undo the booking.
    pub async fn create_reservation(
        &self,
        actor: &Actor,
        req: NewReservation,
    ) -> Result<Reservation, EngineError> {
        if !actor.is_staff() && actor.id != req.client_id {
            return Err(EngineError::Forbidden("clients may only book for themselves"));
        }
        let span = validate_window(req.start, req.end)?;
        self.check_lead_time(&span)?;
        Self::check_amount(req.amount)?;
        let client = self.get_client(&req.client_id)?;

        let mut guard = self.lock_room(&req.room_id).await?;
        if guard.room.removed {
            return Err(EngineError::RoomNotFound(req.room_id));
        }
        if guard.intervals.len() >= MAX_INTERVALS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many reservations on room"));
        }
        check_no_conflict(&guard, &span, None)?;

        let now = self.now();
        let (status, payment_deadline) = if req.payment_method.requires_confirmation() {
            (
                ReservationStatus::PendingPaymentConfirmation,
                Some(now + self.policy.payment_timeout_ms),
            )
        } else {
            (ReservationStatus::Active, None)
        };
        let reservation = Reservation {
            id: Ulid::new(),
            client_id: req.client_id,
            room_id: req.room_id,
            span,
            status,
            payment_method: req.payment_method,
            amount: req.amount,
            mirror_key: None,
            created_at: now,
            payment_deadline,
            closed_at: None,
        };
        let event = Event::ReservationPlaced {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        let room_number = guard.room.number;
        drop(guard);

        metrics::counter!(RESERVATIONS_CREATED_TOTAL, "status" => status.as_str()).increment(1);
        info!(
            reservation_id = %reservation.id,
            room_id = %reservation.room_id,
            client_id = %reservation.client_id,
            %status,
            "reservation created"
        );

        let draft = event_draft(&client, room_number, &reservation);
        match self.mirror.create(reservation.id, &draft).await {
            Some(key) => Ok(self.attach_mirror_key(reservation, key).await),
            None => Ok(reservation),
        }
    }

    /// Record the calendar key of a freshly mirrored event. Failures are
    /// logged and `fallback` is returned; the reservation itself is already
    /// committed.
    async fn attach_mirror_key(&self, fallback: Reservation, key: String) -> Reservation {
        let id = fallback.id;
        let attached = async {
            let (_, mut guard) = self.resolve_reservation_write(&id).await?;
            let event = Event::MirrorKeyAssigned {
                id,
                key: key.clone(),
            };
            self.persist_and_apply(&mut [&mut *guard], &event).await?;
            self.store.get(&id).ok_or(EngineError::ReservationNotFound(id))
        }
        .await;

        match attached {
            // Closed while the calendar call was in flight: bring the event in line.
            Ok(r) if r.status == ReservationStatus::Cancelled => {
                self.mirror.delete(id, &key).await;
                r
            }
            Ok(r) if r.status == ReservationStatus::Finalized => {
                let at = r.closed_at.unwrap_or(r.span.end);
                self.mirror.annotate_finalized(id, &key, at).await;
                r
            }
            Ok(r) => r,
            Err(e) => {
                warn!(reservation_id = %id, mirror_key = %key, error = %e, "failed to record mirror key");
                fallback
            }
        }
    }

    // ── Modification ─────────────────────────────────────

    /// Move a reservation to a new window and/or room and replace its
    /// payment data. Lead time and overlap are checked exactly as on creation,
    /// ignoring the reservation's own slot.
    pub async fn modify_reservation(
        &self,
        actor: &Actor,
        id: Ulid,
        changes: ReservationChanges,
    ) -> Result<Reservation, EngineError> {
        let span = validate_window(changes.start, changes.end)?;
        self.check_lead_time(&span)?;
        Self::check_amount(changes.amount)?;

        let (current, mut guards) = self.lock_reservation_and_target(&id, &changes.room_id).await?;
        if !actor.is_staff() && current.client_id != actor.id {
            return Err(EngineError::Forbidden("not the reservation's owner"));
        }
        if !current.status.is_occupying() {
            return Err(EngineError::NotModifiable(id));
        }

        let target = guards
            .iter()
            .find(|g| g.room.id == changes.room_id)
            .ok_or(EngineError::RoomNotFound(changes.room_id))?;
        if target.room.removed {
            return Err(EngineError::RoomNotFound(changes.room_id));
        }
        if target.room.id != current.room_id && target.intervals.len() >= MAX_INTERVALS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many reservations on room"));
        }
        check_no_conflict(target, &span, Some(id))?;
        let room_number = target.room.number;

        let event = Event::ReservationRescheduled {
            id,
            room_id: changes.room_id,
            span,
            payment_method: changes.payment_method,
            amount: changes.amount,
        };
        let mut refs: Vec<&mut RoomState> = guards.iter_mut().map(|g| &mut **g).collect();
        self.persist_and_apply(&mut refs, &event).await?;
        drop(refs);
        drop(guards);

        let updated = self
            .store
            .get(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        info!(
            reservation_id = %id,
            room_id = %updated.room_id,
            start = updated.span.start,
            end = updated.span.end,
            "reservation modified"
        );

        let Ok(client) = self.get_client(&updated.client_id) else {
            return Ok(updated);
        };
        let draft = event_draft(&client, room_number, &updated);
        match updated.mirror_key.clone() {
            Some(key) => {
                self.mirror.update(id, &key, &draft).await;
                Ok(updated)
            }
            None => match self.mirror.create(id, &draft).await {
                Some(key) => Ok(self.attach_mirror_key(updated, key).await),
                None => Ok(updated),
            },
        }
    }

    /// Lock the reservation's current room and the target room in id order,
    /// retrying if the reservation moved while we waited.
    async fn lock_reservation_and_target(
        &self,
        id: &Ulid,
        target: &Ulid,
    ) -> Result<(Reservation, Vec<OwnedRwLockWriteGuard<RoomState>>), EngineError> {
        loop {
            let seen = self
                .store
                .get(id)
                .ok_or(EngineError::ReservationNotFound(*id))?;
            let guards = self.lock_rooms(&[seen.room_id, *target]).await?;
            let current = self
                .store
                .get(id)
                .ok_or(EngineError::ReservationNotFound(*id))?;
            if current.room_id == seen.room_id {
                return Ok((current, guards));
            }
        }
    }

    // ── Cancellation ─────────────────────────────────────

    /// Cancel on behalf of whoever the actor is.
    pub async fn cancel_reservation(
        &self,
        actor: &Actor,
        id: Ulid,
    ) -> Result<Reservation, EngineError> {
        if actor.is_staff() {
            self.cancel_by_staff(actor, id).await
        } else {
            self.cancel_by_client(actor, id).await
        }
    }

    /// A client cancels their own reservation. Staff actors skip the
    /// ownership check.
    pub async fn cancel_by_client(
        &self,
        actor: &Actor,
        id: Ulid,
    ) -> Result<Reservation, EngineError> {
        let (current, guard) = self.resolve_reservation_write(&id).await?;
        if !actor.is_staff() && current.client_id != actor.id {
            return Err(EngineError::Forbidden("not the reservation's owner"));
        }
        let by = if actor.is_staff() {
            CancelledBy::Staff
        } else {
            CancelledBy::Client
        };
        self.cancel_locked(current, guard, by).await
    }

    pub async fn cancel_by_staff(
        &self,
        actor: &Actor,
        id: Ulid,
    ) -> Result<Reservation, EngineError> {
        if !actor.is_staff() {
            return Err(EngineError::Forbidden("staff only"));
        }
        let (current, guard) = self.resolve_reservation_write(&id).await?;
        self.cancel_locked(current, guard, CancelledBy::Staff).await
    }

    async fn cancel_locked(
        &self,
        current: Reservation,
        mut guard: OwnedRwLockWriteGuard<RoomState>,
        by: CancelledBy,
    ) -> Result<Reservation, EngineError> {
        if current.status != ReservationStatus::Active {
            return Err(EngineError::NotCancelable("only active reservations can be cancelled"));
        }
        let now = self.now();
        if now >= current.span.start {
            return Err(EngineError::NotCancelable("reservation has already started"));
        }

        let event = Event::ReservationCancelled { id: current.id, at: now };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        drop(guard);

        metrics::counter!(RESERVATIONS_CANCELLED_TOTAL, "by" => by.label()).increment(1);
        info!(reservation_id = %current.id, by = by.label(), "reservation cancelled");

        let cancelled = self
            .store
            .get(&current.id)
            .ok_or(EngineError::ReservationNotFound(current.id))?;
        if let Some(key) = &cancelled.mirror_key {
            self.mirror.delete(cancelled.id, key).await;
        }
        Ok(cancelled)
    }

    // ── Payment confirmation ─────────────────────────────

    /// The payment provider confirmed an online payment. A confirmation that
    /// arrives before the sweep expires the reservation still wins.
    pub async fn confirm_payment(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (current, mut guard) = self.resolve_reservation_write(&id).await?;
        if current.status != ReservationStatus::PendingPaymentConfirmation {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status,
                to: ReservationStatus::Active,
            });
        }
        let event = Event::PaymentConfirmed { id, at: self.now() };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        drop(guard);
        info!(reservation_id = %id, "payment confirmed");
        self.store.get(&id).ok_or(EngineError::ReservationNotFound(id))
    }

    /// The payment provider rejected an online payment.
    pub async fn reject_payment(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (current, mut guard) = self.resolve_reservation_write(&id).await?;
        if current.status != ReservationStatus::PendingPaymentConfirmation {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status,
                to: ReservationStatus::Cancelled,
            });
        }
        let event = Event::ReservationCancelled { id, at: self.now() };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        drop(guard);

        metrics::counter!(RESERVATIONS_CANCELLED_TOTAL, "by" => "payment").increment(1);
        info!(reservation_id = %id, "payment rejected, reservation cancelled");

        let rejected = self
            .store
            .get(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        if let Some(key) = &rejected.mirror_key {
            self.mirror.delete(id, key).await;
        }
        Ok(rejected)
    }
}
