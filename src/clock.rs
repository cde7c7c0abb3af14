//! Injected time source.
//!
//! Every timestamp in the wallet flows through a [`Clock`] so that tests can
//! advance time deterministically (approval expiry, rate-limit windows,
//! tracker age-outs). Production code uses [`SystemClock`].

use chrono::{DateTime, Utc};
use std::sync::Arc;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }

    /// UTC day key used by the daily spend limits ("2026-08-01").
    fn utc_day(&self) -> String {
        self.now().format("%Y-%m-%d").to_string()
    }
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Test clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock {
    now_ms: Arc<std::sync::atomic::AtomicI64>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now_ms: Arc::new(std::sync::atomic::AtomicI64::new(start.timestamp_millis())),
        }
    }

    pub fn advance_ms(&self, ms: i64) {
        self.now_ms
            .fetch_add(ms, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance_ms(secs * 1000);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let ms = self.now_ms.load(std::sync::atomic::Ordering::SeqCst);
        DateTime::<Utc>::from_timestamp_millis(ms).expect("valid timestamp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 23, 59, 0).unwrap());
        assert_eq!(clock.utc_day(), "2026-01-01");
        clock.advance_secs(120);
        assert_eq!(clock.utc_day(), "2026-01-02");
    }
}
