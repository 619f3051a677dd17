use tokio::sync::broadcast;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::free_spans;
use super::conflict::{overlapping, validate_query_window};
use super::{Engine, EngineError};

fn validate_room_spec(spec: &RoomSpec) -> Result<(), EngineError> {
    if spec.number == 0 {
        return Err(EngineError::Validation("room number is required"));
    }
    if let Some(d) = &spec.description
        && d.len() > MAX_DESCRIPTION_LEN
    {
        return Err(EngineError::LimitExceeded("room description too long"));
    }
    Ok(())
}

fn validate_client(name: &str, email: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation("client name is required"));
    }
    if email.trim().is_empty() {
        return Err(EngineError::Validation("client email is required"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("client name too long"));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("client email too long"));
    }
    Ok(())
}

impl Engine {
    // ── Clients ──────────────────────────────────────────

    pub async fn register_client(
        &self,
        id: Ulid,
        name: String,
        email: String,
    ) -> Result<Client, EngineError> {
        validate_client(&name, &email)?;
        let _gate = self.sweep_gate.read().await;
        if self.clients.len() >= MAX_CLIENTS {
            return Err(EngineError::LimitExceeded("too many clients"));
        }
        if self.clients.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::ClientRegistered {
            id,
            name: name.clone(),
            email: email.clone(),
        };
        self.persist_detached(&event).await?;
        Ok(Client { id, name, email })
    }

    pub fn get_client(&self, id: &Ulid) -> Result<Client, EngineError> {
        self.clients
            .get(id)
            .map(|c| c.value().clone())
            .ok_or(EngineError::ClientNotFound(*id))
    }

    // ── Room registry ────────────────────────────────────

    pub async fn create_room(&self, id: Ulid, spec: RoomSpec) -> Result<Room, EngineError> {
        validate_room_spec(&spec)?;
        let _gate = self.sweep_gate.read().await;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.rooms.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::RoomCreated {
            id,
            number: spec.number,
            size: spec.size,
            description: spec.description.clone(),
        };
        self.wal_append(&event).await?;
        self.insert_room(id, spec.number, spec.size, spec.description);
        self.notify.send(id, &event);
        tracing::info!(room_id = %id, number = spec.number, "room created");
        self.get_room(&id).await
    }

    /// Edit a room's attributes. A removed room cannot be revived this way.
    pub async fn update_room(&self, id: Ulid, spec: RoomSpec) -> Result<Room, EngineError> {
        validate_room_spec(&spec)?;
        let mut guard = self.lock_room(&id).await?;
        if guard.room.removed {
            return Err(EngineError::RoomNotFound(id));
        }
        let event = Event::RoomUpdated {
            id,
            number: spec.number,
            size: spec.size,
            description: spec.description,
        };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        Ok(guard.room.clone())
    }

    /// Removed rooms are not found.
    pub async fn get_room(&self, id: &Ulid) -> Result<Room, EngineError> {
        let rs = self
            .get_room_state(id)
            .ok_or(EngineError::RoomNotFound(*id))?;
        let guard = rs.read().await;
        if guard.room.removed {
            return Err(EngineError::RoomNotFound(*id));
        }
        Ok(guard.room.clone())
    }

    /// Non-removed rooms ordered by number.
    pub async fn list_rooms(&self) -> Vec<Room> {
        let arcs: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut rooms = Vec::with_capacity(arcs.len());
        for rs in arcs {
            let guard = rs.read().await;
            if !guard.room.removed {
                rooms.push(guard.room.clone());
            }
        }
        rooms.sort_by_key(|r| (r.number, r.id));
        rooms
    }

    /// Soft delete. The occupancy check and the flag write happen under the
    /// room's write lock, so no reservation can slip in between.
    pub async fn soft_delete_room(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.lock_room(&id).await?;
        if guard.room.removed {
            return Err(EngineError::RoomNotFound(id));
        }
        if guard.is_occupied() {
            return Err(EngineError::RoomHasActiveReservations(id));
        }
        let event = Event::RoomRemoved { id };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        tracing::info!(room_id = %id, "room removed");
        Ok(())
    }

    /// Whether `soft_delete_room` would currently succeed.
    pub async fn can_delete_room(&self, id: &Ulid) -> bool {
        let Some(rs) = self.get_room_state(id) else {
            return false;
        };
        let guard = rs.read().await;
        !guard.room.removed && !guard.is_occupied()
    }

    /// True iff the room holds an ACTIVE or pending reservation.
    pub async fn has_occupying_reservation(&self, room_id: &Ulid) -> bool {
        match self.get_room_state(room_id) {
            Some(rs) => rs.read().await.is_occupied(),
            None => false,
        }
    }

    // ── Overlap and availability ─────────────────────────

    /// Occupying reservations on `room_id` overlapping `[start, end)`.
    pub async fn find_overlapping(
        &self,
        room_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let query = validate_query_window(start, end)?;
        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::RoomNotFound(room_id))?;
        let guard = rs.read().await;
        Ok(overlapping(&guard, &query, exclude)
            .iter()
            .filter_map(|id| self.store.get(id))
            .collect())
    }

    /// Non-removed rooms with no occupying reservation overlapping the window.
    /// Rooms are read one at a time, each under its own lock: the answer is
    /// consistent per room, not a snapshot across all rooms.
    pub async fn find_available_rooms(&self, start: Ms, end: Ms) -> Result<Vec<Room>, EngineError> {
        let query = validate_query_window(start, end)?;
        let arcs: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut free = Vec::new();
        for rs in arcs {
            let guard = rs.read().await;
            if !guard.room.removed && guard.overlapping(&query).next().is_none() {
                free.push(guard.room.clone());
            }
        }
        free.sort_by_key(|r| (r.number, r.id));
        Ok(free)
    }

    /// Free sub-spans of `[start, end)` on one room.
    pub async fn room_free_windows(
        &self,
        room_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        let query = validate_query_window(start, end)?;
        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::RoomNotFound(room_id))?;
        let guard = rs.read().await;
        if guard.room.removed {
            return Err(EngineError::RoomNotFound(room_id));
        }
        Ok(free_spans(&guard, &query))
    }

    /// Committed events for one room, in commit order.
    pub fn subscribe(&self, room_id: Ulid) -> Result<broadcast::Receiver<Event>, EngineError> {
        if !self.rooms.contains_key(&room_id) {
            return Err(EngineError::RoomNotFound(room_id));
        }
        Ok(self.notify.subscribe(room_id))
    }
}
