//! Shared fixture for integration tests: a full wallet context over a
//! scriptable mock provider and a manually advanced clock.
#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use std::sync::Arc;
use tempfile::TempDir;

use doged::address::Address;
use doged::app_context::WalletContext;
use doged::chain::mock::MockProvider;
use doged::chain::FailoverChain;
use doged::clock::ManualClock;
use doged::config::Config;
use doged::network_type::NetworkType;
use doged::script::p2pkh_script;
use doged::types::Utxo;
use doged::units::KOINU_PER_DOGE;

pub const OWNER: &str = "telegram:owner-1";
pub const PASSPHRASE: &str = "correct-horse-battery-staple";

pub struct TestWallet {
    pub context: Arc<WalletContext>,
    pub primary: Arc<MockProvider>,
    pub fallback: Arc<MockProvider>,
    pub clock: ManualClock,
    pub address: String,
    pub _dir: TempDir,
}

pub fn doge(amount: u64) -> u64 {
    amount * KOINU_PER_DOGE
}

pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.network = "testnet".to_string();
    config.data_dir = dir.path().to_string_lossy().to_string();
    config.notifications.target = OWNER.to_string();
    config.policy.limits.cooldown_seconds = 0;
    config
}

pub async fn setup() -> TestWallet {
    setup_with(|_| {}).await
}

pub async fn setup_with(tweak: impl FnOnce(&mut Config)) -> TestWallet {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap());
    let mut config = test_config(&dir);
    tweak(&mut config);

    let primary = Arc::new(MockProvider::named("primary"));
    let fallback = Arc::new(MockProvider::named("fallback"));
    let chain = Arc::new(FailoverChain::new(
        vec![
            primary.clone() as Arc<dyn doged::chain::ChainProvider>,
            fallback.clone(),
        ],
        Arc::new(clock.clone()),
    ));
    let context =
        WalletContext::build_with_chain(config, Arc::new(clock.clone()), chain).unwrap();
    context.load_persistence().unwrap();

    let init = context.init_wallet(PASSPHRASE).unwrap();
    TestWallet {
        context,
        primary,
        fallback,
        clock,
        address: init.address,
        _dir: dir,
    }
}

impl TestWallet {
    /// Put one confirmed UTXO of `amount_doge` under the wallet address on
    /// both providers and refresh the store.
    pub async fn fund(&self, txid: &str, amount_doge: u64) {
        let script = hex::encode(p2pkh_script(
            &Address::from_string(&self.address).unwrap(),
        ));
        let utxo = Utxo {
            txid: txid.to_string(),
            vout: 0,
            address: self.address.clone(),
            amount: doge(amount_doge),
            script_pubkey: script,
            confirmations: 10,
            block_height: Some(5_000_000),
            locked: false,
            locked_for: None,
            locked_at: None,
        };
        self.primary.set_utxos(vec![utxo.clone()]);
        self.fallback.set_utxos(vec![utxo]);
        self.context.refresh_utxos().await.unwrap();
    }
}

/// A deterministic recipient address on testnet.
pub fn recipient() -> String {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[0x77u8; 32]).unwrap();
    let pk = PublicKey::from_secret_key(&secp, &sk);
    Address::from_public_key(&pk, NetworkType::Testnet).to_string()
}
