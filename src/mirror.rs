//! Calendar mirror: a best-effort, eventually-consistent copy of each
//! reservation in an external calendar.
//!
//! The engine talks to the calendar only through [`MirrorDispatcher`], which
//! bounds every call with a timeout and turns failures into log lines. A
//! mirror failure never fails or rolls back the reservation change that
//! triggered it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono_tz::Tz;
use dashmap::DashMap;
use tracing::warn;
use ulid::Ulid;

use crate::clock::format_local;
use crate::model::Ms;

pub const FINALIZED_TITLE_PREFIX: &str = "✅ FINALIZADO - ";
pub const FINALIZED_MARKER: &str = "Estado: FINALIZADO";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorError {
    Unavailable(String),
    NotFound(String),
    Rejected(String),
    Timeout,
}

impl std::fmt::Display for MirrorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MirrorError::Unavailable(e) => write!(f, "calendar unavailable: {e}"),
            MirrorError::NotFound(key) => write!(f, "calendar event not found: {key}"),
            MirrorError::Rejected(e) => write!(f, "calendar rejected request: {e}"),
            MirrorError::Timeout => write!(f, "calendar call timed out"),
        }
    }
}

impl std::error::Error for MirrorError {}

/// Title, description and window of a mirrored event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDraft {
    pub title: String,
    pub description: String,
    pub start: Ms,
    pub end: Ms,
}

/// Contract of the external calendar collaborator.
#[async_trait]
pub trait CalendarMirror: Send + Sync {
    /// Returns the key of the new event.
    async fn create_event(&self, draft: &EventDraft) -> Result<String, MirrorError>;

    async fn update_event(&self, key: &str, draft: &EventDraft) -> Result<(), MirrorError>;

    /// Deleting an unknown key succeeds.
    async fn delete_event(&self, key: &str) -> Result<(), MirrorError>;

    /// Mark the event finalized. Calling it twice must not duplicate markers.
    async fn annotate_finalized(
        &self,
        key: &str,
        reservation_id: Ulid,
        finalized_at: Ms,
    ) -> Result<(), MirrorError>;
}

// ── In-process calendar ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    pub summary: String,
    pub description: String,
    pub start: Ms,
    pub end: Ms,
    pub color_id: Option<String>,
    pub private: BTreeMap<String, String>,
}

/// Calendar kept in process memory. Used by the binary when no external
/// calendar is wired, and by tests.
pub struct InMemoryCalendar {
    events: DashMap<String, CalendarEvent>,
    next_key: AtomicU64,
    timezone: Tz,
    finalized_color: String,
}

impl InMemoryCalendar {
    pub fn new(timezone: Tz, finalized_color: impl Into<String>) -> Self {
        Self {
            events: DashMap::new(),
            next_key: AtomicU64::new(1),
            timezone,
            finalized_color: finalized_color.into(),
        }
    }

    pub fn event(&self, key: &str) -> Option<CalendarEvent> {
        self.events.get(key).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[async_trait]
impl CalendarMirror for InMemoryCalendar {
    async fn create_event(&self, draft: &EventDraft) -> Result<String, MirrorError> {
        let key = format!("evt-{}", self.next_key.fetch_add(1, Ordering::Relaxed));
        self.events.insert(
            key.clone(),
            CalendarEvent {
                summary: draft.title.clone(),
                description: draft.description.clone(),
                start: draft.start,
                end: draft.end,
                color_id: None,
                private: BTreeMap::new(),
            },
        );
        Ok(key)
    }

    async fn update_event(&self, key: &str, draft: &EventDraft) -> Result<(), MirrorError> {
        let mut event = self
            .events
            .get_mut(key)
            .ok_or_else(|| MirrorError::NotFound(key.to_string()))?;
        event.summary = draft.title.clone();
        event.description = draft.description.clone();
        event.start = draft.start;
        event.end = draft.end;
        Ok(())
    }

    async fn delete_event(&self, key: &str) -> Result<(), MirrorError> {
        self.events.remove(key);
        Ok(())
    }

    async fn annotate_finalized(
        &self,
        key: &str,
        reservation_id: Ulid,
        finalized_at: Ms,
    ) -> Result<(), MirrorError> {
        let mut event = self
            .events
            .get_mut(key)
            .ok_or_else(|| MirrorError::NotFound(key.to_string()))?;
        let finalized_local = format_local(finalized_at, self.timezone);

        event.color_id = Some(self.finalized_color.clone());
        if !event.summary.starts_with(FINALIZED_TITLE_PREFIX) {
            event.summary = format!("{FINALIZED_TITLE_PREFIX}{}", event.summary);
        }
        if !event.description.contains(FINALIZED_MARKER) {
            event.description.push_str(&format!(
                "\n\n---\n{FINALIZED_MARKER}\nReserva ID: {reservation_id}\nFinalizado: {finalized_local}\n"
            ));
        }
        event
            .private
            .insert("reservaId".into(), reservation_id.to_string());
        event.private.insert("estado".into(), "FINALIZADO".into());
        event.private.insert("finalizadoEn".into(), finalized_local);
        Ok(())
    }
}

// ── Dispatcher ───────────────────────────────────────────────────

/// Timeout-bounded, swallow-and-log front for a [`CalendarMirror`].
#[derive(Clone)]
pub struct MirrorDispatcher {
    mirror: Arc<dyn CalendarMirror>,
    timeout: Duration,
}

impl MirrorDispatcher {
    pub fn new(mirror: Arc<dyn CalendarMirror>, timeout: Duration) -> Self {
        Self { mirror, timeout }
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, MirrorError>>,
    ) -> Result<T, MirrorError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .unwrap_or(Err(MirrorError::Timeout))
    }

    fn failed(op: &'static str, reservation_id: Ulid, key: Option<&str>, err: &MirrorError) {
        warn!(
            %reservation_id,
            mirror_key = key.unwrap_or("-"),
            error = %err,
            "calendar mirror {op} failed"
        );
        metrics::counter!(crate::observability::MIRROR_FAILURES_TOTAL, "op" => op).increment(1);
    }

    /// Returns the new event key, or `None` if the calendar call failed.
    pub async fn create(&self, reservation_id: Ulid, draft: &EventDraft) -> Option<String> {
        match self.bounded(self.mirror.create_event(draft)).await {
            Ok(key) => Some(key),
            Err(e) => {
                Self::failed("create", reservation_id, None, &e);
                None
            }
        }
    }

    pub async fn update(&self, reservation_id: Ulid, key: &str, draft: &EventDraft) {
        if let Err(e) = self.bounded(self.mirror.update_event(key, draft)).await {
            Self::failed("update", reservation_id, Some(key), &e);
        }
    }

    pub async fn delete(&self, reservation_id: Ulid, key: &str) {
        if let Err(e) = self.bounded(self.mirror.delete_event(key)).await {
            Self::failed("delete", reservation_id, Some(key), &e);
        }
    }

    pub async fn annotate_finalized(&self, reservation_id: Ulid, key: &str, finalized_at: Ms) {
        if let Err(e) = self
            .bounded(self.mirror.annotate_finalized(key, reservation_id, finalized_at))
            .await
        {
            Self::failed("annotate", reservation_id, Some(key), &e);
        }
    }
}
