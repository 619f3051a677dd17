use std::time::Instant;

use futures::StreamExt;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::MIRROR_FANOUT;
use crate::model::*;
use crate::observability::{
    SWEEP_DURATION_SECONDS, SWEEP_FINALIZED_TOTAL, SWEEP_PAYMENTS_EXPIRED_TOTAL,
};

use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub finalized: usize,
    pub payments_expired: usize,
}

impl Engine {
    /// Move every selected reservation `from` → (event's target state) as one
    /// WAL record. Runs under the sweep gate plus the write lock of every
    /// affected room, so readers see the batch entirely or not at all.
    async fn bulk_close(
        &self,
        from: ReservationStatus,
        due: impl Fn(&Reservation, Ms) -> bool,
        make_event: impl FnOnce(Vec<Ulid>, Ms) -> Event,
    ) -> Result<(Vec<Reservation>, Ms), EngineError> {
        let _gate = self.sweep_gate.write().await;
        let now = self.now();
        let candidates = self.store.matching(from, |r| due(r, now));
        if candidates.is_empty() {
            return Ok((Vec::new(), now));
        }

        let room_ids: Vec<Ulid> = candidates.iter().map(|r| r.room_id).collect();
        let mut guards = self.lock_rooms(&room_ids).await?;

        // Re-select under the room locks: a modification may have moved a
        // candidate before we got here.
        let ids: Vec<Ulid> = candidates
            .iter()
            .filter_map(|c| self.store.get(&c.id))
            .filter(|r| r.status == from && due(r, now) && room_ids.contains(&r.room_id))
            .map(|r| r.id)
            .collect();
        if ids.is_empty() {
            return Ok((Vec::new(), now));
        }

        let event = make_event(ids.clone(), now);
        let mut refs: Vec<&mut RoomState> = guards.iter_mut().map(|g| &mut **g).collect();
        self.persist_and_apply(&mut refs, &event).await?;

        let closed = ids.iter().filter_map(|id| self.store.get(id)).collect();
        Ok((closed, now))
    }

    /// ACTIVE reservations whose window has ended become FINALIZED in one
    /// atomic step; their calendar events are then annotated best-effort.
    /// Safe to call concurrently: the second caller finds nothing to do.
    pub async fn finalize_expired(&self) -> Result<usize, EngineError> {
        let (finalized, at) = self
            .bulk_close(
                ReservationStatus::Active,
                |r, now| r.span.end <= now,
                |ids, at| Event::ReservationsFinalized { ids, at },
            )
            .await?;
        if finalized.is_empty() {
            debug!("sweep: nothing to finalize");
            return Ok(0);
        }

        metrics::counter!(SWEEP_FINALIZED_TOTAL).increment(finalized.len() as u64);
        info!(count = finalized.len(), "finalized expired reservations");

        futures::stream::iter(
            finalized
                .iter()
                .filter_map(|r| r.mirror_key.as_deref().map(|key| (r.id, key))),
        )
        .for_each_concurrent(MIRROR_FANOUT, |(id, key)| async move {
            self.mirror.annotate_finalized(id, key, at).await;
        })
        .await;

        Ok(finalized.len())
    }

    /// Pending reservations whose payment deadline passed are cancelled in
    /// one atomic step; their calendar events are then deleted best-effort.
    pub async fn expire_unconfirmed_payments(&self) -> Result<usize, EngineError> {
        let (expired, _) = self
            .bulk_close(
                ReservationStatus::PendingPaymentConfirmation,
                |r, now| r.payment_deadline.is_some_and(|d| d <= now),
                |ids, at| Event::PaymentsExpired { ids, at },
            )
            .await?;
        if expired.is_empty() {
            debug!("sweep: no unconfirmed payments past deadline");
            return Ok(0);
        }

        metrics::counter!(SWEEP_PAYMENTS_EXPIRED_TOTAL).increment(expired.len() as u64);
        info!(count = expired.len(), "cancelled reservations with unconfirmed payment");

        futures::stream::iter(
            expired
                .iter()
                .filter_map(|r| r.mirror_key.as_deref().map(|key| (r.id, key))),
        )
        .for_each_concurrent(MIRROR_FANOUT, |(id, key)| async move {
            self.mirror.delete(id, key).await;
        })
        .await;

        Ok(expired.len())
    }

    /// One tick of the periodic trigger.
    pub async fn run_sweep(&self) -> Result<SweepReport, EngineError> {
        let started = Instant::now();
        let payments_expired = self.expire_unconfirmed_payments().await?;
        let finalized = self.finalize_expired().await?;
        metrics::histogram!(SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        Ok(SweepReport {
            finalized,
            payments_expired,
        })
    }
}
