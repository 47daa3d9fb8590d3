#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use custody_engines::admission::{
    AdmissionGate, SolveBudget, ADMISSION_BUDGET_MS_DEFAULT, ADMISSION_DIFFICULTY_BITS_DEFAULT,
    ADMISSION_MAX_ATTEMPTS_DEFAULT,
};

use crate::offline_queue::FlushSchedule;

pub const LEDGER_CONNECT_TIMEOUT_MS_DEFAULT: u64 = 3_000;
pub const LEDGER_REQUEST_TIMEOUT_MS_DEFAULT: u64 = 15_000;
pub const FLUSH_MAX_IN_FLIGHT_DEFAULT: usize = 3;
pub const FLUSH_INTERVAL_MS_DEFAULT: u64 = 15_000;
pub const FLUSH_MAX_BACKOFF_MS_DEFAULT: u64 = 300_000;
pub const SESSION_TTL_MS_DEFAULT: u64 = 12 * 60 * 60 * 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpLedgerConfig {
    pub records_endpoint: String,
    pub blobs_endpoint: String,
    pub bearer_token: Option<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl HttpLedgerConfig {
    pub fn from_env() -> Option<Self> {
        let records_endpoint = non_empty_env("CUSTODY_LEDGER_ENDPOINT")?;
        let records_endpoint = records_endpoint.trim_end_matches('/').to_string();
        let blobs_endpoint = non_empty_env("CUSTODY_BLOB_ENDPOINT")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_else(|| derive_blobs_endpoint(&records_endpoint));
        Some(Self {
            records_endpoint,
            blobs_endpoint,
            bearer_token: non_empty_env("CUSTODY_LEDGER_BEARER"),
            connect_timeout_ms: ranged_env(
                "CUSTODY_LEDGER_CONNECT_TIMEOUT_MS",
                100..=60_000,
                LEDGER_CONNECT_TIMEOUT_MS_DEFAULT,
            ),
            request_timeout_ms: ranged_env(
                "CUSTODY_LEDGER_REQUEST_TIMEOUT_MS",
                100..=120_000,
                LEDGER_REQUEST_TIMEOUT_MS_DEFAULT,
            ),
        })
    }

    /// Both endpoints under one server base, e.g. `http://127.0.0.1:8088`.
    pub fn for_base_url(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            records_endpoint: format!("{base}/v1/ledger/records"),
            blobs_endpoint: format!("{base}/v1/blobs"),
            bearer_token: None,
            connect_timeout_ms: LEDGER_CONNECT_TIMEOUT_MS_DEFAULT,
            request_timeout_ms: LEDGER_REQUEST_TIMEOUT_MS_DEFAULT,
        }
    }
}

/// `.../v1/ledger/records` maps to `.../v1/blobs`; anything else gets a sibling `blobs`.
fn derive_blobs_endpoint(records_endpoint: &str) -> String {
    if let Some(base) = records_endpoint.strip_suffix("/ledger/records") {
        return format!("{base}/blobs");
    }
    match records_endpoint.rsplit_once('/') {
        Some((parent, _)) => format!("{parent}/blobs"),
        None => format!("{records_endpoint}/blobs"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodyConfig {
    pub ledger: Option<HttpLedgerConfig>,
    pub pow_difficulty_bits: u8,
    pub pow_budget_ms: u64,
    pub flush_max_in_flight: usize,
    pub flush_interval_ms: u64,
    pub network_timeout_ms: u64,
    /// Idle time after which a saved track session is discarded on open.
    pub session_ttl_ms: u64,
    pub data_dir: PathBuf,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            ledger: None,
            pow_difficulty_bits: ADMISSION_DIFFICULTY_BITS_DEFAULT,
            pow_budget_ms: ADMISSION_BUDGET_MS_DEFAULT,
            flush_max_in_flight: FLUSH_MAX_IN_FLIGHT_DEFAULT,
            flush_interval_ms: FLUSH_INTERVAL_MS_DEFAULT,
            network_timeout_ms: LEDGER_REQUEST_TIMEOUT_MS_DEFAULT,
            session_ttl_ms: SESSION_TTL_MS_DEFAULT,
            data_dir: default_data_dir(),
        }
    }
}

impl CustodyConfig {
    pub fn from_env() -> Self {
        let ledger = HttpLedgerConfig::from_env();
        let network_timeout_ms = ledger
            .as_ref()
            .map(|c| c.request_timeout_ms)
            .unwrap_or(LEDGER_REQUEST_TIMEOUT_MS_DEFAULT);
        Self {
            ledger,
            pow_difficulty_bits: ranged_env(
                "CUSTODY_POW_DIFFICULTY_BITS",
                1..=32,
                u64::from(ADMISSION_DIFFICULTY_BITS_DEFAULT),
            ) as u8,
            pow_budget_ms: ranged_env(
                "CUSTODY_POW_BUDGET_MS",
                10..=30_000,
                ADMISSION_BUDGET_MS_DEFAULT,
            ),
            flush_max_in_flight: ranged_env(
                "CUSTODY_FLUSH_MAX_IN_FLIGHT",
                1..=8,
                FLUSH_MAX_IN_FLIGHT_DEFAULT as u64,
            ) as usize,
            flush_interval_ms: ranged_env(
                "CUSTODY_FLUSH_INTERVAL_MS",
                100..=3_600_000,
                FLUSH_INTERVAL_MS_DEFAULT,
            ),
            network_timeout_ms,
            session_ttl_ms: ranged_env(
                "CUSTODY_SESSION_TTL_MS",
                60_000..=30 * 24 * 60 * 60 * 1_000,
                SESSION_TTL_MS_DEFAULT,
            ),
            data_dir: non_empty_env("CUSTODY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_data_dir),
        }
    }

    pub fn admission_gate(&self) -> AdmissionGate {
        AdmissionGate::new(
            self.pow_difficulty_bits,
            SolveBudget {
                max_duration: Duration::from_millis(self.pow_budget_ms),
                max_attempts: ADMISSION_MAX_ATTEMPTS_DEFAULT,
            },
        )
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn flush_schedule(&self) -> FlushSchedule {
        let interval = Duration::from_millis(self.flush_interval_ms);
        FlushSchedule {
            interval,
            max_backoff: Duration::from_millis(FLUSH_MAX_BACKOFF_MS_DEFAULT).max(interval),
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }

    pub fn envelope_dir(&self) -> PathBuf {
        self.data_dir.join("offline")
    }

    pub fn session_dir(&self) -> PathBuf {
        self.data_dir.join("session")
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().and_then(|v| {
        let s = v.trim().to_string();
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    })
}

fn ranged_env(name: &str, range: std::ops::RangeInclusive<u64>, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| range.contains(v))
        .unwrap_or(default)
}

fn default_data_dir() -> PathBuf {
    if let Ok(xdg_data_home) = env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg_data_home).join("custody");
    }
    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("custody");
    }
    PathBuf::from(".custody")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_config_01_blob_endpoint_derived_from_records_endpoint() {
        assert_eq!(
            derive_blobs_endpoint("https://ledger.example/v1/ledger/records"),
            "https://ledger.example/v1/blobs"
        );
        assert_eq!(
            derive_blobs_endpoint("https://ledger.example/api/rows"),
            "https://ledger.example/api/blobs"
        );
    }

    #[test]
    fn at_config_02_base_url_layout_matches_adapter_routes() {
        let c = HttpLedgerConfig::for_base_url("http://127.0.0.1:8088/");
        assert_eq!(c.records_endpoint, "http://127.0.0.1:8088/v1/ledger/records");
        assert_eq!(c.blobs_endpoint, "http://127.0.0.1:8088/v1/blobs");
    }

    #[test]
    fn at_config_03_default_gate_uses_default_difficulty() {
        let c = CustodyConfig::default();
        assert_eq!(
            c.admission_gate().difficulty_bits,
            ADMISSION_DIFFICULTY_BITS_DEFAULT
        );
        assert_eq!(c.flush_max_in_flight, FLUSH_MAX_IN_FLIGHT_DEFAULT);
    }

    #[test]
    fn at_config_04_flush_schedule_and_session_ttl() {
        let c = CustodyConfig {
            flush_interval_ms: 600_000,
            ..CustodyConfig::default()
        };
        let schedule = c.flush_schedule();
        assert_eq!(schedule.interval, Duration::from_millis(600_000));
        assert_eq!(schedule.max_backoff, Duration::from_millis(600_000));
        assert_eq!(
            CustodyConfig::default().session_ttl(),
            Duration::from_millis(SESSION_TTL_MS_DEFAULT)
        );
    }
}
