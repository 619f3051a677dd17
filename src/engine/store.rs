use dashmap::DashMap;
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::model::*;

/// Authoritative reservation records plus secondary indexes.
///
/// Pure data access: no business rules beyond refusing illegal status edges.
/// Callers serialize writes to a record through the owning room's lock.
pub struct ReservationStore {
    records: DashMap<Ulid, Reservation>,
    by_client: DashMap<Ulid, Vec<Ulid>>,
    by_room: DashMap<Ulid, Vec<Ulid>>,
    by_mirror_key: DashMap<String, Ulid>,
}

impl Default for ReservationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservationStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            by_client: DashMap::new(),
            by_room: DashMap::new(),
            by_mirror_key: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    // ── Writes ───────────────────────────────────────────────

    /// Insert or replace a record, keeping every index in step.
    pub fn save(&self, reservation: Reservation) -> Reservation {
        let id = reservation.id;
        if let Some(old) = self.records.get(&id).map(|e| e.value().clone()) {
            if old.room_id != reservation.room_id {
                Self::unlink(&self.by_room, &old.room_id, &id);
                self.by_room.entry(reservation.room_id).or_default().push(id);
            }
            if old.client_id != reservation.client_id {
                Self::unlink(&self.by_client, &old.client_id, &id);
                self.by_client.entry(reservation.client_id).or_default().push(id);
            }
            if old.mirror_key != reservation.mirror_key
                && let Some(key) = &old.mirror_key
            {
                self.by_mirror_key.remove(key);
            }
        } else {
            self.by_room.entry(reservation.room_id).or_default().push(id);
            self.by_client.entry(reservation.client_id).or_default().push(id);
        }
        if let Some(key) = &reservation.mirror_key {
            self.by_mirror_key.insert(key.clone(), id);
        }
        self.records.insert(id, reservation.clone());
        reservation
    }

    /// Move a reservation to a new room/window and replace its payment data.
    pub fn reschedule(
        &self,
        id: Ulid,
        room_id: Ulid,
        span: Span,
        payment_method: PaymentMethod,
        amount: Option<Decimal>,
    ) -> Option<Reservation> {
        let mut r = self.get(&id)?;
        r.room_id = room_id;
        r.span = span;
        r.payment_method = payment_method;
        r.amount = amount;
        Some(self.save(r))
    }

    pub fn set_mirror_key(&self, id: Ulid, key: String) -> Option<Reservation> {
        let mut r = self.get(&id)?;
        r.mirror_key = Some(key);
        Some(self.save(r))
    }

    /// Move one record along a legal edge. `None` if absent or the edge is illegal.
    pub fn transition(&self, id: Ulid, to: ReservationStatus, at: Ms) -> Option<Reservation> {
        let mut entry = self.records.get_mut(&id)?;
        if !entry.status.can_transition_to(to) {
            return None;
        }
        entry.status = to;
        if to.is_terminal() {
            entry.closed_at = Some(at);
        }
        if to != ReservationStatus::PendingPaymentConfirmation {
            entry.payment_deadline = None;
        }
        Some(entry.clone())
    }

    /// Move every listed record that is still in `from` to `to`.
    /// Records that left `from` in the meantime are skipped.
    pub fn bulk_transition(
        &self,
        ids: &[Ulid],
        from: ReservationStatus,
        to: ReservationStatus,
        at: Ms,
    ) -> Vec<Reservation> {
        ids.iter()
            .filter(|id| self.records.get(id).is_some_and(|r| r.status == from))
            .filter_map(|id| self.transition(*id, to, at))
            .collect()
    }

    fn unlink(index: &DashMap<Ulid, Vec<Ulid>>, key: &Ulid, id: &Ulid) {
        if let Some(mut ids) = index.get_mut(key) {
            ids.retain(|x| x != id);
        }
    }

    // ── Reads ────────────────────────────────────────────────

    pub fn get(&self, id: &Ulid) -> Option<Reservation> {
        self.records.get(id).map(|e| e.value().clone())
    }

    pub fn find_by_mirror_key(&self, key: &str) -> Option<Reservation> {
        let id = *self.by_mirror_key.get(key)?;
        self.get(&id)
    }

    pub fn all(&self) -> Vec<Reservation> {
        self.records.iter().map(|e| e.value().clone()).collect()
    }

    pub fn list_by_status(&self, status: ReservationStatus) -> Vec<Reservation> {
        self.list_by_status_in(&[status])
    }

    pub fn list_by_status_in(&self, statuses: &[ReservationStatus]) -> Vec<Reservation> {
        self.records
            .iter()
            .filter(|e| statuses.contains(&e.status))
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn list_by_client(&self, client_id: &Ulid) -> Vec<Reservation> {
        self.collect_index(&self.by_client, client_id)
    }

    pub fn list_by_room(&self, room_id: &Ulid) -> Vec<Reservation> {
        self.collect_index(&self.by_room, room_id)
    }

    fn collect_index(&self, index: &DashMap<Ulid, Vec<Ulid>>, key: &Ulid) -> Vec<Reservation> {
        let ids = index.get(key).map(|e| e.value().clone()).unwrap_or_default();
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Records in `status` satisfying `condition`.
    pub fn matching(
        &self,
        status: ReservationStatus,
        condition: impl Fn(&Reservation) -> bool,
    ) -> Vec<Reservation> {
        self.records
            .iter()
            .filter(|e| e.status == status && condition(e.value()))
            .map(|e| e.value().clone())
            .collect()
    }
}
