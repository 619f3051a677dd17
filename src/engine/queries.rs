use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

const CALENDAR_STATES: [ReservationStatus; 3] = [
    ReservationStatus::Active,
    ReservationStatus::PendingPaymentConfirmation,
    ReservationStatus::Finalized,
];

fn by_start(mut v: Vec<Reservation>) -> Vec<Reservation> {
    v.sort_by_key(|r| (r.span.start, r.id));
    v
}

/// Most recent first, closed reservations only.
fn history(v: Vec<Reservation>) -> Vec<Reservation> {
    let mut closed: Vec<Reservation> = v
        .into_iter()
        .filter(|r| !r.status.is_occupying())
        .collect();
    closed.sort_by(|a, b| b.span.start.cmp(&a.span.start).then(b.id.cmp(&a.id)));
    closed
}

impl Engine {
    pub fn get_reservation(&self, id: &Ulid) -> Result<Reservation, EngineError> {
        self.store
            .get(id)
            .ok_or(EngineError::ReservationNotFound(*id))
    }

    /// Map an external calendar event back to its reservation.
    pub fn find_by_mirror_key(&self, key: &str) -> Option<Reservation> {
        self.store.find_by_mirror_key(key)
    }

    pub async fn list_all(&self) -> Vec<Reservation> {
        let _gate = self.sweep_gate.read().await;
        by_start(self.store.all())
    }

    pub async fn list_by_status(&self, status: ReservationStatus) -> Vec<Reservation> {
        let _gate = self.sweep_gate.read().await;
        by_start(self.store.list_by_status(status))
    }

    pub async fn list_by_room(&self, room_id: &Ulid) -> Vec<Reservation> {
        let _gate = self.sweep_gate.read().await;
        by_start(self.store.list_by_room(room_id))
    }

    pub async fn list_for_client(&self, client_id: &Ulid) -> Vec<Reservation> {
        let _gate = self.sweep_gate.read().await;
        by_start(self.store.list_by_client(client_id))
    }

    // ── Sweep-first listings ─────────────────────────────
    //
    // These finalize overdue reservations before reading, so a caller never
    // sees an ACTIVE reservation whose window already ended.

    pub async fn list_active(&self) -> Result<Vec<Reservation>, EngineError> {
        self.finalize_expired().await?;
        let _gate = self.sweep_gate.read().await;
        Ok(by_start(self.store.list_by_status(ReservationStatus::Active)))
    }

    /// Everything a calendar view shows: upcoming, awaiting payment and done.
    pub async fn list_calendar(&self) -> Result<Vec<Reservation>, EngineError> {
        self.finalize_expired().await?;
        let _gate = self.sweep_gate.read().await;
        Ok(by_start(self.store.list_by_status_in(&CALENDAR_STATES)))
    }

    /// A client's reservations that still hold a room.
    pub async fn list_active_for_client(
        &self,
        client_id: &Ulid,
    ) -> Result<Vec<Reservation>, EngineError> {
        self.finalize_expired().await?;
        let _gate = self.sweep_gate.read().await;
        let occupying = self
            .store
            .list_by_client(client_id)
            .into_iter()
            .filter(|r| r.status.is_occupying())
            .collect();
        Ok(by_start(occupying))
    }

    // ── History ──────────────────────────────────────────

    pub async fn list_history(&self) -> Vec<Reservation> {
        let _gate = self.sweep_gate.read().await;
        history(self.store.all())
    }

    pub async fn list_history_for_client(&self, client_id: &Ulid) -> Vec<Reservation> {
        let _gate = self.sweep_gate.read().await;
        history(self.store.list_by_client(client_id))
    }
}
