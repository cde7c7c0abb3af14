//! Spending policy: tier classification, velocity limits, freeze.
//!
//! `evaluate` is the single gate every outbound send passes before the
//! transaction pipeline may run. It is pure decision logic over injected
//! state (spend history, freeze flag, configured tiers); queueing and owner
//! interaction live in the approval queue.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::clock::SharedClock;
use crate::error::WalletError;
use crate::secure_fs;
use crate::units::format_doge;

pub const LIMITS_FILE: &str = "limits.json";
pub const FREEZE_FILE: &str = "freeze.json";

const HOUR_MS: i64 = 3_600_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Micro,
    Small,
    Medium,
    Large,
    Sweep,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Tier::Micro => "micro",
            Tier::Small => "small",
            Tier::Medium => "medium",
            Tier::Large => "large",
            Tier::Sweep => "sweep",
        };
        write!(f, "{s}")
    }
}

/// Approval mode a tier declares in configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalMode {
    Auto,
    AutoLogged,
    NotifyDelay,
    OwnerRequired,
    OwnerConfirmCode,
}

/// What the caller must do next with this send.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyAction {
    /// Proceed immediately.
    Auto,
    /// Proceed immediately, but notify the owner.
    Notify,
    /// Queue; auto-approves after the delay unless the owner objects.
    Delay,
    /// Queue; the owner must approve.
    Approve,
    /// Queue; the owner must approve with a confirmation code.
    ConfirmCode,
    /// Refused.
    Deny,
}

#[derive(Clone, Debug)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub tier: Option<Tier>,
    pub action: PolicyAction,
    pub reason: String,
    pub delay_minutes: Option<u64>,
}

impl PolicyDecision {
    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            tier: None,
            action: PolicyAction::Deny,
            reason: reason.into(),
            delay_minutes: None,
        }
    }
}

/// One tier's boundary and approval behavior, amounts in koinu.
#[derive(Clone, Copy, Debug)]
pub struct TierRule {
    /// Inclusive upper bound; `None` for the unbounded sweep tier.
    pub max_amount: Option<u64>,
    pub approval: ApprovalMode,
    pub delay_minutes: Option<u64>,
}

/// Velocity limits, amounts in koinu.
#[derive(Clone, Copy, Debug)]
pub struct VelocityLimits {
    pub daily_max: u64,
    pub hourly_max: u64,
    pub tx_count_daily_max: u32,
    pub cooldown_seconds: u64,
}

#[derive(Clone, Debug)]
pub struct PolicyRules {
    pub enabled: bool,
    pub tiers: [(Tier, TierRule); 5],
    pub limits: VelocityLimits,
    pub allowlist: Vec<String>,
    pub denylist: Vec<String>,
}

// ── Spend tracker (limits.json) ───────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendRecord {
    pub amount_koinu: u64,
    /// Unix ms.
    pub timestamp: i64,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct LimitsFile {
    version: u32,
    records: Vec<SpendRecord>,
    current_day: String,
    last_spend_at: Option<i64>,
}

/// Today's spend history (UTC day boundary). Records from prior days are
/// discarded on rollover.
pub struct SpendTracker {
    path: PathBuf,
    clock: SharedClock,
    state: Mutex<LimitsFile>,
}

impl SpendTracker {
    pub fn new(data_dir: &std::path::Path, clock: SharedClock) -> Self {
        Self {
            path: data_dir.join(LIMITS_FILE),
            clock,
            state: Mutex::new(LimitsFile {
                version: 1,
                ..Default::default()
            }),
        }
    }

    pub fn load(&self) -> Result<(), WalletError> {
        if let Some(file) = secure_fs::read_json::<LimitsFile>(&self.path)? {
            *self.state.lock() = file;
        }
        self.rollover();
        Ok(())
    }

    /// Drop records that no longer belong to "today" (UTC).
    fn rollover(&self) {
        let today = self.clock.utc_day();
        let mut state = self.state.lock();
        if state.current_day != today {
            state.current_day = today;
            state.records.clear();
        }
    }

    pub fn record_spend(&self, amount_koinu: u64) {
        self.rollover();
        let now = self.clock.now_ms();
        {
            let mut state = self.state.lock();
            state.records.push(SpendRecord {
                amount_koinu,
                timestamp: now,
            });
            state.last_spend_at = Some(now);
        }
        self.persist();
    }

    pub fn spent_today(&self) -> u64 {
        self.rollover();
        self.state.lock().records.iter().map(|r| r.amount_koinu).sum()
    }

    pub fn spent_last_hour(&self) -> u64 {
        self.rollover();
        let cutoff = self.clock.now_ms() - HOUR_MS;
        self.state
            .lock()
            .records
            .iter()
            .filter(|r| r.timestamp > cutoff)
            .map(|r| r.amount_koinu)
            .sum()
    }

    pub fn count_today(&self) -> u32 {
        self.rollover();
        self.state.lock().records.len() as u32
    }

    pub fn last_spend_at_ms(&self) -> Option<i64> {
        self.state.lock().last_spend_at
    }

    /// Called by shutdown so a restart cannot reset the windows.
    pub fn persist(&self) {
        let state = self.state.lock();
        if let Err(e) = secure_fs::write_json(&self.path, &*state) {
            tracing::warn!(error = %e, "Failed to persist spend limits");
        }
    }
}

// ── Freeze flag (freeze.json) ─────────────────────────────────────────────

#[derive(Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
struct FreezeFile {
    frozen: bool,
    reason: Option<String>,
    updated_at: Option<String>,
}

pub struct FreezeFlag {
    path: PathBuf,
    clock: SharedClock,
    state: Mutex<FreezeFile>,
}

impl FreezeFlag {
    pub fn new(data_dir: &std::path::Path, clock: SharedClock) -> Self {
        Self {
            path: data_dir.join(FREEZE_FILE),
            clock,
            state: Mutex::new(FreezeFile::default()),
        }
    }

    pub fn load(&self, initial_frozen: bool) -> Result<(), WalletError> {
        match secure_fs::read_json::<FreezeFile>(&self.path)? {
            Some(file) => *self.state.lock() = file,
            None => self.state.lock().frozen = initial_frozen,
        }
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.state.lock().frozen
    }

    pub fn set_frozen(&self, frozen: bool, reason: Option<String>) {
        {
            let mut state = self.state.lock();
            state.frozen = frozen;
            state.reason = reason;
            state.updated_at = Some(self.clock.now().to_rfc3339());
        }
        let state = self.state.lock().clone();
        if let Err(e) = secure_fs::write_json(&self.path, &state) {
            tracing::warn!(error = %e, "Failed to persist freeze flag");
        }
        if frozen {
            tracing::warn!("🧊 Wallet frozen — all sends will be denied");
        } else {
            tracing::info!("Wallet unfrozen");
        }
    }
}

// ── Policy engine ─────────────────────────────────────────────────────────

pub struct PolicyEngine {
    rules: PolicyRules,
    tracker: Arc<SpendTracker>,
    freeze: Arc<FreezeFlag>,
    clock: SharedClock,
}

impl PolicyEngine {
    pub fn new(
        rules: PolicyRules,
        tracker: Arc<SpendTracker>,
        freeze: Arc<FreezeFlag>,
        clock: SharedClock,
    ) -> Self {
        Self {
            rules,
            tracker,
            freeze,
            clock,
        }
    }

    pub fn classify_tier(&self, amount_koinu: u64) -> (Tier, TierRule) {
        for (tier, rule) in &self.rules.tiers {
            match rule.max_amount {
                Some(max) if amount_koinu <= max => return (*tier, *rule),
                None => return (*tier, *rule),
                _ => continue,
            }
        }
        // the sweep tier is unbounded, so the loop always returns; keep the
        // compiler satisfied
        let (tier, rule) = self.rules.tiers[4];
        (tier, rule)
    }

    /// Evaluation order: disabled → frozen → denylist → velocity →
    /// allowlist → tier.
    pub fn evaluate(&self, amount_koinu: u64, recipient: &str, _reason: &str) -> PolicyDecision {
        if !self.rules.enabled {
            return PolicyDecision {
                allowed: true,
                tier: None,
                action: PolicyAction::Auto,
                reason: "policy disabled".into(),
                delay_minutes: None,
            };
        }

        if self.freeze.is_frozen() {
            return PolicyDecision::deny("wallet is frozen");
        }

        if self.rules.denylist.iter().any(|a| a == recipient) {
            return PolicyDecision::deny("recipient is denylisted");
        }

        let limits = &self.rules.limits;
        let spent_today = self.tracker.spent_today();
        if spent_today + amount_koinu > limits.daily_max {
            return PolicyDecision::deny(format!(
                "daily limit exceeded: {} + {} > {} DOGE",
                format_doge(spent_today),
                format_doge(amount_koinu),
                format_doge(limits.daily_max)
            ));
        }
        let spent_hour = self.tracker.spent_last_hour();
        if spent_hour + amount_koinu > limits.hourly_max {
            return PolicyDecision::deny(format!(
                "hourly limit exceeded: {} + {} > {} DOGE",
                format_doge(spent_hour),
                format_doge(amount_koinu),
                format_doge(limits.hourly_max)
            ));
        }
        if self.tracker.count_today() + 1 > limits.tx_count_daily_max {
            return PolicyDecision::deny(format!(
                "daily transaction count limit reached ({})",
                limits.tx_count_daily_max
            ));
        }
        if let Some(last) = self.tracker.last_spend_at_ms() {
            let elapsed_ms = self.clock.now_ms() - last;
            let cooldown_ms = limits.cooldown_seconds as i64 * 1000;
            if elapsed_ms < cooldown_ms {
                return PolicyDecision::deny(format!(
                    "cooldown: {}s remaining between sends",
                    (cooldown_ms - elapsed_ms) / 1000
                ));
            }
        }

        if self.rules.allowlist.iter().any(|a| a == recipient) {
            return PolicyDecision {
                allowed: true,
                tier: None,
                action: PolicyAction::Auto,
                reason: "recipient is allowlisted".into(),
                delay_minutes: None,
            };
        }

        let (tier, rule) = self.classify_tier(amount_koinu);
        let (allowed, action) = match rule.approval {
            ApprovalMode::Auto => (true, PolicyAction::Auto),
            ApprovalMode::AutoLogged => (true, PolicyAction::Notify),
            ApprovalMode::NotifyDelay => (false, PolicyAction::Delay),
            ApprovalMode::OwnerRequired => (false, PolicyAction::Approve),
            ApprovalMode::OwnerConfirmCode => (false, PolicyAction::ConfirmCode),
        };
        PolicyDecision {
            allowed,
            tier: Some(tier),
            action,
            reason: format!("tier {tier}"),
            delay_minutes: rule.delay_minutes,
        }
    }

    pub fn record_spend(&self, amount_koinu: u64) {
        self.tracker.record_spend(amount_koinu);
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze.is_frozen()
    }
}
