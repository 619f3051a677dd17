use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;

use crate::engine::{BookingPolicy, EngineOptions};
use crate::model::Ms;

const MINUTE_MS: Ms = 60_000;

/// Process configuration, read from `SALAS_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub timezone: Tz,
    pub min_lead_minutes: i64,
    pub payment_timeout_minutes: i64,
    pub sweep_interval: Duration,
    pub mirror_timeout: Duration,
    pub store_timeout: Duration,
    pub compact_threshold: u64,
    /// Calendar color applied to finalized events.
    pub finalized_color: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            timezone: chrono_tz::America::Argentina::Buenos_Aires,
            min_lead_minutes: 60,
            payment_timeout_minutes: 30,
            sweep_interval: Duration::from_secs(60),
            mirror_timeout: Duration::from_millis(5_000),
            store_timeout: Duration::from_millis(5_000),
            compact_threshold: 1_000,
            finalized_color: "2".into(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to the default;
    /// an unknown time zone is an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let defaults = Self::default();

        let timezone = match lookup("SALAS_TIMEZONE") {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|e| format!("SALAS_TIMEZONE: {e}"))?,
            None => defaults.timezone,
        };

        Ok(Self {
            data_dir: lookup("SALAS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: parse_var(&lookup, "SALAS_METRICS_PORT"),
            timezone,
            min_lead_minutes: parse_var(&lookup, "SALAS_MIN_LEAD_MINUTES")
                .unwrap_or(defaults.min_lead_minutes),
            payment_timeout_minutes: parse_var(&lookup, "SALAS_PAYMENT_TIMEOUT_MINUTES")
                .unwrap_or(defaults.payment_timeout_minutes),
            sweep_interval: parse_var(&lookup, "SALAS_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            mirror_timeout: parse_var(&lookup, "SALAS_MIRROR_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.mirror_timeout),
            store_timeout: parse_var(&lookup, "SALAS_STORE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.store_timeout),
            compact_threshold: parse_var(&lookup, "SALAS_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            finalized_color: lookup("SALAS_FINALIZED_COLOR").unwrap_or(defaults.finalized_color),
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("salas.wal")
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            policy: BookingPolicy {
                timezone: self.timezone,
                min_lead_ms: self.min_lead_minutes * MINUTE_MS,
                payment_timeout_ms: self.payment_timeout_minutes * MINUTE_MS,
            },
            store_timeout: self.store_timeout,
            mirror_timeout: self.mirror_timeout,
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring unparseable {key}={raw:?}, using default");
            None
        }
    }
}
