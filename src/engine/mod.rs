mod availability;
mod conflict;
mod error;
mod lifecycle;
mod queries;
mod rooms;
mod store;
mod sweep;
#[cfg(test)]
mod tests;

pub use availability::free_spans;
pub use error::EngineError;
pub use store::ReservationStore;
pub use sweep::SweepReport;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::clock::Clock;
use crate::mirror::{CalendarMirror, MirrorDispatcher};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Business rules that depend on deployment settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingPolicy {
    pub timezone: Tz,
    /// Minimum notice between now and a reservation's start.
    pub min_lead_ms: Ms,
    /// How long an online payment may stay unconfirmed.
    pub payment_timeout_ms: Ms,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::America::Argentina::Buenos_Aires,
            min_lead_ms: 60 * 60_000,
            payment_timeout_ms: 30 * 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub policy: BookingPolicy,
    /// Upper bound for queueing a WAL append or acquiring a room lock.
    pub store_timeout: Duration,
    /// Upper bound for each calendar mirror call.
    pub mirror_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            policy: BookingPolicy::default(),
            store_timeout: Duration::from_secs(5),
            mirror_timeout: Duration::from_secs(5),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends.
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    pub(super) clients: DashMap<Ulid, Client>,
    pub(super) store: ReservationStore,
    /// Write: sweeps and compaction. Read: multi-record listings and
    /// structural writes (new clients, new rooms).
    pub(super) sweep_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) mirror: MirrorDispatcher,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) policy: BookingPolicy,
    store_timeout: Duration,
}

/// Apply an event to in-memory state. Caller holds the write lock of every
/// room the event touches and passes those rooms in `rooms`.
/// `RoomCreated` is handled at the map level, not here.
fn apply_event(
    store: &ReservationStore,
    clients: &DashMap<Ulid, Client>,
    rooms: &mut [&mut RoomState],
    event: &Event,
) {
    fn room<'a>(rooms: &'a mut [&mut RoomState], id: Ulid) -> Option<&'a mut RoomState> {
        rooms.iter_mut().find(|rs| rs.room.id == id).map(|rs| &mut **rs)
    }

    match event {
        Event::ClientRegistered { id, name, email } => {
            clients.insert(
                *id,
                Client {
                    id: *id,
                    name: name.clone(),
                    email: email.clone(),
                },
            );
        }
        Event::RoomCreated { .. } => {}
        Event::RoomUpdated {
            id,
            number,
            size,
            description,
        } => {
            if let Some(rs) = room(rooms, *id) {
                rs.room.number = *number;
                rs.room.size = *size;
                rs.room.capacity = size.capacity();
                rs.room.description = description.clone();
            }
        }
        Event::RoomRemoved { id } => {
            if let Some(rs) = room(rooms, *id) {
                rs.room.removed = true;
            }
        }
        Event::ReservationPlaced { reservation } => {
            let saved = store.save(reservation.clone());
            if let Some(interval) = Interval::for_reservation(&saved)
                && let Some(rs) = room(rooms, saved.room_id)
            {
                rs.insert_interval(interval);
            }
        }
        Event::ReservationRescheduled {
            id,
            room_id,
            span,
            payment_method,
            amount,
        } => {
            if let Some(old) = store.get(id)
                && let Some(rs) = room(rooms, old.room_id)
            {
                rs.remove_interval(*id);
            }
            if let Some(moved) = store.reschedule(*id, *room_id, *span, *payment_method, *amount)
                && let Some(interval) = Interval::for_reservation(&moved)
                && let Some(rs) = room(rooms, moved.room_id)
            {
                rs.insert_interval(interval);
            }
        }
        Event::MirrorKeyAssigned { id, key } => {
            store.set_mirror_key(*id, key.clone());
        }
        Event::PaymentConfirmed { id, at } => {
            if let Some(confirmed) = store.transition(*id, ReservationStatus::Active, *at)
                && let Some(rs) = room(rooms, confirmed.room_id)
            {
                rs.remove_interval(*id);
                if let Some(interval) = Interval::for_reservation(&confirmed) {
                    rs.insert_interval(interval);
                }
            }
        }
        Event::ReservationCancelled { id, at } => {
            if let Some(cancelled) = store.transition(*id, ReservationStatus::Cancelled, *at)
                && let Some(rs) = room(rooms, cancelled.room_id)
            {
                rs.remove_interval(*id);
            }
        }
        Event::ReservationsFinalized { ids, at } => {
            let done = store.bulk_transition(
                ids,
                ReservationStatus::Active,
                ReservationStatus::Finalized,
                *at,
            );
            for r in done {
                if let Some(rs) = room(rooms, r.room_id) {
                    rs.remove_interval(r.id);
                }
            }
        }
        Event::PaymentsExpired { ids, at } => {
            let done = store.bulk_transition(
                ids,
                ReservationStatus::PendingPaymentConfirmation,
                ReservationStatus::Cancelled,
                *at,
            );
            for r in done {
                if let Some(rs) = room(rooms, r.room_id) {
                    rs.remove_interval(r.id);
                }
            }
        }
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        options: EngineOptions,
        mirror: Arc<dyn CalendarMirror>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            clients: DashMap::new(),
            store: ReservationStore::new(),
            sweep_gate: RwLock::new(()),
            wal_tx,
            notify: Arc::new(NotifyHub::new()),
            mirror: MirrorDispatcher::new(mirror, options.mirror_timeout),
            clock,
            policy: options.policy,
            store_timeout: options.store_timeout,
        };

        // We're the sole owner of these Arcs, so try_write always succeeds.
        // Never use blocking_write here: this may run inside an async context.
        for event in &events {
            if let Event::RoomCreated {
                id,
                number,
                size,
                description,
            } = event
            {
                engine.insert_room(*id, *number, *size, description.clone());
                continue;
            }
            let arcs: Vec<SharedRoomState> = engine
                .rooms_touched_by(event)
                .iter()
                .filter_map(|id| engine.get_room_state(id))
                .collect();
            let mut guards: Vec<OwnedRwLockWriteGuard<RoomState>> = arcs
                .into_iter()
                .map(|rs| rs.try_write_owned().expect("replay: uncontended write"))
                .collect();
            let mut refs: Vec<&mut RoomState> = guards.iter_mut().map(|g| &mut **g).collect();
            apply_event(&engine.store, &engine.clients, &mut refs, event);
        }

        tracing::info!(
            "replayed {} events: {} rooms, {} clients, {} reservations",
            events.len(),
            engine.rooms.len(),
            engine.clients.len(),
            engine.store.len()
        );
        Ok(engine)
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    pub(super) fn insert_room(
        &self,
        id: Ulid,
        number: u32,
        size: RoomSize,
        description: Option<String>,
    ) {
        let rs = RoomState::new(Room {
            id,
            number,
            size,
            capacity: size.capacity(),
            description,
            removed: false,
        });
        self.rooms.insert(id, Arc::new(RwLock::new(rs)));
    }

    /// Rooms an event touches, sorted, looked up from current state.
    fn rooms_touched_by(&self, event: &Event) -> Vec<Ulid> {
        let room_of = |id: &Ulid| self.store.get(id).map(|r| r.room_id);
        let mut ids: Vec<Ulid> = match event {
            Event::ClientRegistered { .. } | Event::RoomCreated { .. } => Vec::new(),
            Event::RoomUpdated { id, .. } | Event::RoomRemoved { id } => vec![*id],
            Event::ReservationPlaced { reservation } => vec![reservation.room_id],
            Event::ReservationRescheduled { id, room_id, .. } => {
                room_of(id).into_iter().chain([*room_id]).collect()
            }
            Event::MirrorKeyAssigned { id, .. }
            | Event::PaymentConfirmed { id, .. }
            | Event::ReservationCancelled { id, .. } => room_of(id).into_iter().collect(),
            Event::ReservationsFinalized { ids, .. } | Event::PaymentsExpired { ids, .. } => {
                ids.iter().filter_map(room_of).collect()
            }
        };
        ids.sort();
        ids.dedup();
        ids
    }

    /// Write event to WAL via the background group-commit writer.
    /// Only the enqueue is bounded by the store timeout: once the writer has
    /// the event the caller waits for its fsync, still holding its room locks,
    /// so a reported failure never leaves the event on disk.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        let cmd = WalCommand::Append {
            event: event.clone(),
            response: tx,
        };
        self.wal_tx
            .send_timeout(cmd, self.store_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => EngineError::Timeout("WAL append"),
                SendTimeoutError::Closed(_) => EngineError::WalError("WAL writer shut down".into()),
            })?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn get_room_state(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    /// Acquire a room's write lock, bounded by the store timeout.
    pub(super) async fn lock_room(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let rs = self
            .get_room_state(id)
            .ok_or(EngineError::RoomNotFound(*id))?;
        tokio::time::timeout(self.store_timeout, rs.write_owned())
            .await
            .map_err(|_| EngineError::Timeout("room lock"))
    }

    /// Lock several rooms in sorted id order.
    pub(super) async fn lock_rooms(
        &self,
        ids: &[Ulid],
    ) -> Result<Vec<OwnedRwLockWriteGuard<RoomState>>, EngineError> {
        let mut sorted = ids.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for id in &sorted {
            guards.push(self.lock_room(id).await?);
        }
        Ok(guards)
    }

    /// Look up a reservation and lock the room it currently sits in.
    /// Retries if a concurrent modification moved it while we waited.
    pub(super) async fn resolve_reservation_write(
        &self,
        id: &Ulid,
    ) -> Result<(Reservation, OwnedRwLockWriteGuard<RoomState>), EngineError> {
        loop {
            let seen = self
                .store
                .get(id)
                .ok_or(EngineError::ReservationNotFound(*id))?;
            let guard = self.lock_room(&seen.room_id).await?;
            let current = self
                .store
                .get(id)
                .ok_or(EngineError::ReservationNotFound(*id))?;
            if current.room_id == seen.room_id {
                return Ok((current, guard));
            }
        }
    }

    /// WAL-append + apply + notify. `rooms` are the locked rooms the event touches.
    pub(super) async fn persist_and_apply(
        &self,
        rooms: &mut [&mut RoomState],
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_event(&self.store, &self.clients, rooms, event);
        for rs in rooms.iter() {
            self.notify.send(rs.room.id, event);
        }
        Ok(())
    }

    /// Persist an event that touches no room.
    pub(super) async fn persist_detached(&self, event: &Event) -> Result<(), EngineError> {
        self.persist_and_apply(&mut [], event).await
    }

    // ── Compaction ───────────────────────────────────────

    /// Rewrite the WAL with the minimal events that recreate current state.
    /// Holds the sweep gate and every room lock so the snapshot is consistent.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.sweep_gate.write().await;
        let room_ids: Vec<Ulid> = self.rooms.iter().map(|e| *e.key()).collect();
        let guards = self.lock_rooms(&room_ids).await?;

        let mut events = Vec::with_capacity(self.clients.len() + guards.len() + self.store.len());
        for client in self.clients.iter() {
            events.push(Event::ClientRegistered {
                id: client.id,
                name: client.name.clone(),
                email: client.email.clone(),
            });
        }
        for rs in &guards {
            events.push(Event::RoomCreated {
                id: rs.room.id,
                number: rs.room.number,
                size: rs.room.size,
                description: rs.room.description.clone(),
            });
            if rs.room.removed {
                events.push(Event::RoomRemoved { id: rs.room.id });
            }
        }
        let mut reservations = self.store.all();
        reservations.sort_by_key(|r| r.id);
        events.extend(
            reservations
                .into_iter()
                .map(|reservation| Event::ReservationPlaced { reservation }),
        );

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
