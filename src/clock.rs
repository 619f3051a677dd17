use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use chrono_tz::Tz;

use crate::model::Ms;

/// Source of "now". Injected into the engine so lead-time and expiry rules
/// can be driven deterministically.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as Ms)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Ms) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Ms) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}

/// Local wall-clock time in the business zone → Unix millis.
///
/// DST gap fallback: a local time that does not exist resolves as UTC.
pub fn local_to_ms(naive: NaiveDateTime, tz: Tz) -> Ms {
    naive
        .and_local_timezone(tz)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|| naive.and_utc().timestamp_millis())
}

/// Calendar date of `at` in the business zone.
pub fn local_date(at: Ms, tz: Tz) -> NaiveDate {
    DateTime::from_timestamp_millis(at)
        .unwrap_or_default()
        .with_timezone(&tz)
        .date_naive()
}

/// 00:00 of the day after `now`, in the business zone.
pub fn start_of_tomorrow(now: Ms, tz: Tz) -> Ms {
    let today = local_date(now, tz);
    let tomorrow = today.succ_opt().unwrap_or(today);
    local_to_ms(tomorrow.and_time(chrono::NaiveTime::MIN), tz)
}

/// Earliest start a new or modified reservation may have:
/// `max(start of tomorrow, now + lead)`. Early in the day the "not today"
/// floor dominates; late in the day the lead-time floor does.
pub fn minimum_allowed_start(now: Ms, tz: Tz, min_lead_ms: Ms) -> Ms {
    start_of_tomorrow(now, tz).max(now + min_lead_ms)
}

/// `YYYY-MM-DD HH:MM` in the business zone.
pub fn format_local(at: Ms, tz: Tz) -> String {
    DateTime::from_timestamp_millis(at)
        .unwrap_or_default()
        .with_timezone(&tz)
        .format("%Y-%m-%d %H:%M")
        .to_string()
}
