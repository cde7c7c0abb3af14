//! Low-balance alert state.
//!
//! The core only stores and exposes this state (`alert-state.json`); the
//! notifier that actually messages the owner lives outside. The refresh
//! loop consults `should_alert` after each balance update, and the dismiss
//! flag resets itself once the balance recovers above the threshold.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::clock::SharedClock;
use crate::error::WalletError;
use crate::secure_fs;

pub const ALERT_STATE_FILE: &str = "alert-state.json";

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AlertState {
    pub dismissed: bool,
    pub snoozed_until: Option<String>,
    pub last_alerted_balance: Option<u64>,
    pub dismissed_at_threshold: Option<u64>,
    pub last_notified_at: Option<String>,
}

pub struct AlertStore {
    path: PathBuf,
    clock: SharedClock,
    state: Mutex<AlertState>,
}

impl AlertStore {
    pub fn new(data_dir: &std::path::Path, clock: SharedClock) -> Self {
        Self {
            path: data_dir.join(ALERT_STATE_FILE),
            clock,
            state: Mutex::new(AlertState::default()),
        }
    }

    pub fn load(&self) -> Result<(), WalletError> {
        if let Some(state) = secure_fs::read_json::<AlertState>(&self.path)? {
            *self.state.lock() = state;
        }
        Ok(())
    }

    pub fn get(&self) -> AlertState {
        self.state.lock().clone()
    }

    /// Whether the external notifier should fire for `balance` under
    /// `threshold` koinu. Also clears a stale dismissal once the balance
    /// has recovered.
    pub fn should_alert(&self, balance: u64, threshold: u64) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();

        if balance >= threshold {
            if state.dismissed {
                state.dismissed = false;
                state.dismissed_at_threshold = None;
                drop(state);
                self.persist();
            }
            return false;
        }
        if state.dismissed {
            return false;
        }
        if let Some(snoozed) = &state.snoozed_until {
            if let Ok(until) = chrono::DateTime::parse_from_rfc3339(snoozed) {
                if now < until {
                    return false;
                }
            }
        }
        true
    }

    /// Called by the notifier after it messaged the owner.
    pub fn mark_notified(&self, balance: u64) {
        {
            let mut state = self.state.lock();
            state.last_alerted_balance = Some(balance);
            state.last_notified_at = Some(self.clock.now().to_rfc3339());
        }
        self.persist();
    }

    pub fn dismiss(&self, threshold: u64) {
        {
            let mut state = self.state.lock();
            state.dismissed = true;
            state.dismissed_at_threshold = Some(threshold);
        }
        self.persist();
    }

    pub fn snooze_until(&self, until_rfc3339: &str) {
        {
            let mut state = self.state.lock();
            state.snoozed_until = Some(until_rfc3339.to_string());
        }
        self.persist();
    }

    fn persist(&self) {
        let state = self.state.lock().clone();
        if let Err(e) = secure_fs::write_json(&self.path, &state) {
            tracing::warn!(error = %e, "Failed to persist alert state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn alerts_below_threshold_until_dismissed() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap());
        let store = AlertStore::new(dir.path(), Arc::new(clock.clone()));

        assert!(store.should_alert(100, 1_000));
        store.dismiss(1_000);
        assert!(!store.should_alert(100, 1_000));

        // recovery clears the dismissal, so the next dip alerts again
        assert!(!store.should_alert(2_000, 1_000));
        assert!(store.should_alert(100, 1_000));
    }

    #[test]
    fn snooze_suppresses_until_deadline() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap());
        let store = AlertStore::new(dir.path(), Arc::new(clock.clone()));

        let until = (clock.now() + chrono::Duration::hours(1)).to_rfc3339();
        store.snooze_until(&until);
        assert!(!store.should_alert(100, 1_000));
        clock.advance_secs(3_601);
        assert!(store.should_alert(100, 1_000));
    }
}
