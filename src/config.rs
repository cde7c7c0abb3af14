//! Configuration for the wallet daemon.
//!
//! Loaded from TOML, with serde defaults for everything optional, and a
//! mainnet-safety pass that refuses configurations a compromised or
//! misconfigured agent could abuse (policy off on mainnet, absurd limits).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::error::WalletError;
use crate::network_type::NetworkType;
use crate::pipeline::{FeePolicy, FeeStrategy};
use crate::policy::{ApprovalMode, PolicyRules, Tier, TierRule, VelocityLimits};
use crate::units::doge_to_koinu;

/// Platform data directory: `~/.doged`, testnet under `~/.doged/testnet`.
pub fn get_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".doged")
}

pub fn get_network_data_dir(network: &NetworkType) -> PathBuf {
    let base = get_data_dir();
    match network {
        NetworkType::Mainnet => base,
        NetworkType::Testnet => base.join("testnet"),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_network")]
    pub network: String,
    /// Root for all persisted state; auto-configured when empty.
    #[serde(default)]
    pub data_dir: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub utxo: UtxoConfig,
    #[serde(default)]
    pub fees: FeesConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub a2a: A2aConfig,
    #[serde(default)]
    pub keystore: KeystoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A2aConfig {
    /// Payee name stamped on issued invoices.
    #[serde(default = "default_payee_name")]
    pub payee_name: String,
    /// Optional operator contact advertised on invoices.
    #[serde(default)]
    pub operator: String,
}

fn default_payee_name() -> String {
    "doged-agent".to_string()
}

impl Default for A2aConfig {
    fn default() -> Self {
        Self {
            payee_name: default_payee_name(),
            operator: String::new(),
        }
    }
}

fn default_network() -> String {
    "testnet".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// "blockcypher" or "sochain".
    #[serde(default = "default_primary")]
    pub primary: String,
    /// Second provider, or "none" to disable failover.
    #[serde(default = "default_fallback")]
    pub fallback: String,
    #[serde(default)]
    pub blockcypher: BlockCypherConfig,
    #[serde(default)]
    pub sochain: SoChainConfig,
    #[serde(default)]
    pub price_api: PriceApiConfig,
}

fn default_primary() -> String {
    "blockcypher".to_string()
}

fn default_fallback() -> String {
    "sochain".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            fallback: default_fallback(),
            blockcypher: BlockCypherConfig::default(),
            sochain: SoChainConfig::default(),
            price_api: PriceApiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BlockCypherConfig {
    #[serde(default)]
    pub api_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SoChainConfig {
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceApiConfig {
    #[serde(default = "default_price_url")]
    pub base_url: String,
    #[serde(default = "default_price_ttl")]
    pub cache_ttl_seconds: u64,
}

fn default_price_url() -> String {
    "https://api.coingecko.com/api/v3".to_string()
}

fn default_price_ttl() -> u64 {
    300
}

impl Default for PriceApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_price_url(),
            cache_ttl_seconds: default_price_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Initial freeze state; the runtime flag persists separately.
    #[serde(default)]
    pub freeze: bool,
    #[serde(default)]
    pub tiers: TiersConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub denylist: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            freeze: false,
            tiers: TiersConfig::default(),
            limits: LimitsConfig::default(),
            allowlist: Vec::new(),
            denylist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Inclusive upper bound in DOGE; ignored for sweep.
    #[serde(default)]
    pub max_amount: f64,
    /// "auto", "auto-logged", "notify-delay", "owner-required",
    /// "owner-confirm-code".
    pub approval: ApprovalMode,
    #[serde(default)]
    pub delay_minutes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TiersConfig {
    pub micro: TierConfig,
    pub small: TierConfig,
    pub medium: TierConfig,
    pub large: TierConfig,
    pub sweep: TierConfig,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            micro: TierConfig {
                max_amount: 10.0,
                approval: ApprovalMode::Auto,
                delay_minutes: None,
            },
            small: TierConfig {
                max_amount: 100.0,
                approval: ApprovalMode::NotifyDelay,
                delay_minutes: Some(5),
            },
            medium: TierConfig {
                max_amount: 1_000.0,
                approval: ApprovalMode::OwnerRequired,
                delay_minutes: None,
            },
            large: TierConfig {
                max_amount: 10_000.0,
                approval: ApprovalMode::OwnerConfirmCode,
                delay_minutes: None,
            },
            sweep: TierConfig {
                max_amount: 0.0,
                approval: ApprovalMode::OwnerConfirmCode,
                delay_minutes: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// DOGE per UTC day.
    #[serde(default = "default_daily_max")]
    pub daily_max: f64,
    /// DOGE per rolling hour.
    #[serde(default = "default_hourly_max")]
    pub hourly_max: f64,
    #[serde(default = "default_tx_count")]
    pub tx_count_daily_max: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
}

fn default_daily_max() -> f64 {
    1_000.0
}

fn default_hourly_max() -> f64 {
    250.0
}

fn default_tx_count() -> u32 {
    20
}

fn default_cooldown() -> u64 {
    30
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            daily_max: default_daily_max(),
            hourly_max: default_hourly_max(),
            tx_count_daily_max: default_tx_count(),
            cooldown_seconds: default_cooldown(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxoConfig {
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,
    /// Koinu.
    #[serde(default = "default_dust")]
    pub dust_threshold: u64,
    /// Spendable-output count above which consolidation is suggested.
    #[serde(default = "default_consolidation")]
    pub consolidation_threshold: usize,
    #[serde(default = "default_min_conf")]
    pub min_confirmations: u32,
}

fn default_refresh_interval() -> u64 {
    180
}

fn default_dust() -> u64 {
    100_000
}

fn default_consolidation() -> usize {
    50
}

fn default_min_conf() -> u32 {
    1
}

impl Default for UtxoConfig {
    fn default() -> Self {
        Self {
            refresh_interval_seconds: default_refresh_interval(),
            dust_threshold: default_dust(),
            consolidation_threshold: default_consolidation(),
            min_confirmations: default_min_conf(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeesConfig {
    /// "low", "medium", "high".
    #[serde(default = "default_fee_strategy")]
    pub strategy: String,
    /// Koinu per kB ceiling.
    #[serde(default = "default_max_fee")]
    pub max_fee_per_kb: u64,
    /// Koinu per kB used when no estimate is available.
    #[serde(default = "default_fallback_fee")]
    pub fallback_fee_per_kb: u64,
}

fn default_fee_strategy() -> String {
    "medium".to_string()
}

fn default_max_fee() -> u64 {
    10_000_000 // 0.1 DOGE per kB
}

fn default_fallback_fee() -> u64 {
    1_000_000 // 0.01 DOGE per kB
}

impl Default for FeesConfig {
    fn default() -> Self {
        Self {
            strategy: default_fee_strategy(),
            max_fee_per_kb: default_max_fee(),
            fallback_fee_per_kb: default_fallback_fee(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Primary owner identity for approval decisions.
    #[serde(default)]
    pub target: String,
    /// Additional owner identities.
    #[serde(default)]
    pub owner_chat_ids: Vec<String>,
    /// Low-balance alert threshold in DOGE.
    #[serde(default = "default_low_balance")]
    pub low_balance_threshold_doge: f64,
}

fn default_low_balance() -> f64 {
    10.0
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            owner_chat_ids: Vec::new(),
            low_balance_threshold_doge: default_low_balance(),
        }
    }
}

impl NotificationsConfig {
    /// Every identity allowed to resolve approvals.
    pub fn owner_identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .owner_chat_ids
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();
        if !self.target.is_empty() && !ids.contains(&self.target) {
            ids.insert(0, self.target.clone());
        }
        ids
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoreConfig {
    /// Inactivity auto-lock in milliseconds; 0 disables.
    #[serde(default = "default_auto_lock")]
    pub auto_lock_ms: u64,
}

fn default_auto_lock() -> u64 {
    900_000 // 15 minutes
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            auto_lock_ms: default_auto_lock(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
    /// "stdout" or "file".
    #[serde(default = "default_log_output")]
    pub output: String,
    #[serde(default = "default_log_path")]
    pub file_path: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

fn default_log_path() -> String {
    "./logs/doged.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
            file_path: default_log_path(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: default_network(),
            data_dir: String::new(),
            api: ApiConfig::default(),
            policy: PolicyConfig::default(),
            utxo: UtxoConfig::default(),
            fees: FeesConfig::default(),
            notifications: NotificationsConfig::default(),
            a2a: A2aConfig::default(),
            keystore: KeystoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn network_type(&self) -> Result<NetworkType, WalletError> {
        NetworkType::from_str_loose(&self.network)
            .ok_or_else(|| WalletError::Config(format!("unknown network `{}`", self.network)))
    }

    pub fn fee_strategy(&self) -> Result<FeeStrategy, WalletError> {
        match self.fees.strategy.to_lowercase().as_str() {
            "low" => Ok(FeeStrategy::Low),
            "medium" => Ok(FeeStrategy::Medium),
            "high" => Ok(FeeStrategy::High),
            other => Err(WalletError::Config(format!("unknown fee strategy `{other}`"))),
        }
    }

    pub fn fee_policy(&self) -> Result<FeePolicy, WalletError> {
        Ok(FeePolicy {
            strategy: self.fee_strategy()?,
            max_fee_per_kb: self.fees.max_fee_per_kb,
            fallback_fee_per_kb: self.fees.fallback_fee_per_kb,
        })
    }

    /// Validate everything that cannot be fixed up silently.
    pub fn validate(&self) -> Result<(), WalletError> {
        self.network_type()?;
        self.fee_strategy()?;
        for (label, name) in [("primary", &self.api.primary), ("fallback", &self.api.fallback)] {
            match name.to_lowercase().as_str() {
                "blockcypher" | "sochain" => {}
                "none" if label == "fallback" => {}
                other => {
                    return Err(WalletError::Config(format!(
                        "unknown {label} provider `{other}`"
                    )))
                }
            }
        }
        if self.fees.max_fee_per_kb == 0 || self.fees.fallback_fee_per_kb == 0 {
            return Err(WalletError::Config("fee rates must be non-zero".into()));
        }
        let tiers = [
            self.policy.tiers.micro.max_amount,
            self.policy.tiers.small.max_amount,
            self.policy.tiers.medium.max_amount,
            self.policy.tiers.large.max_amount,
        ];
        if tiers.windows(2).any(|w| w[0] >= w[1]) {
            return Err(WalletError::Config(
                "tier boundaries must be strictly increasing".into(),
            ));
        }
        Ok(())
    }

    /// Refuse footgun configurations on mainnet.
    pub fn apply_mainnet_safety(&mut self) {
        if !matches!(self.network_type(), Ok(NetworkType::Mainnet)) {
            return;
        }
        if !self.policy.enabled {
            tracing::warn!("Policy cannot be disabled on mainnet; re-enabling");
            self.policy.enabled = true;
        }
        if self.utxo.min_confirmations == 0 {
            tracing::warn!("min_confirmations=0 is unsafe on mainnet; using 1");
            self.utxo.min_confirmations = 1;
        }
    }

    /// Materialize the policy rules in koinu.
    pub fn policy_rules(&self) -> Result<PolicyRules, WalletError> {
        let t = &self.policy.tiers;
        let to_koinu = |doge: f64, what: &str| {
            doge_to_koinu(doge)
                .ok_or_else(|| WalletError::Config(format!("bad amount for {what}: {doge}")))
        };
        let tier = |tier: Tier, cfg: &TierConfig, bounded: bool| -> Result<(Tier, TierRule), WalletError> {
            Ok((
                tier,
                TierRule {
                    max_amount: if bounded {
                        Some(to_koinu(cfg.max_amount, "tier bound")?)
                    } else {
                        None
                    },
                    approval: cfg.approval,
                    delay_minutes: cfg.delay_minutes,
                },
            ))
        };
        Ok(PolicyRules {
            enabled: self.policy.enabled,
            tiers: [
                tier(Tier::Micro, &t.micro, true)?,
                tier(Tier::Small, &t.small, true)?,
                tier(Tier::Medium, &t.medium, true)?,
                tier(Tier::Large, &t.large, true)?,
                tier(Tier::Sweep, &t.sweep, false)?,
            ],
            limits: VelocityLimits {
                daily_max: to_koinu(self.policy.limits.daily_max, "daily_max")?,
                hourly_max: to_koinu(self.policy.limits.hourly_max, "hourly_max")?,
                tx_count_daily_max: self.policy.limits.tx_count_daily_max,
                cooldown_seconds: self.policy.limits.cooldown_seconds,
            },
            allowlist: self.policy.allowlist.clone(),
            denylist: self.policy.denylist.clone(),
        })
    }

    pub fn resolved_data_dir(&self) -> Result<PathBuf, WalletError> {
        if self.data_dir.is_empty() {
            Ok(get_network_data_dir(&self.network_type()?))
        } else {
            Ok(PathBuf::from(&self.data_dir))
        }
    }

    pub fn load_from_file(path: &str) -> Result<Self, WalletError> {
        let contents = fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&contents).map_err(|e| WalletError::Config(e.to_string()))?;
        Ok(config)
    }

    pub fn load_or_create(path: &str) -> Result<Self, WalletError> {
        if fs::metadata(path).is_ok() {
            let mut config = Self::load_from_file(path)?;
            config.validate()?;
            config.apply_mainnet_safety();
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to_file(path)?;
            Ok(config)
        }
    }

    pub fn save_to_file(&self, path: &str) -> Result<(), WalletError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| WalletError::Config(e.to_string()))?;
        fs::write(path, contents)?;
        Ok(())
    }
}
