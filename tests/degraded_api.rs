//! Provider degradation: failover keeps the wallet functional and the
//! confirmation tracker never converts API trouble into a false failure.

mod common;

use common::{doge, recipient, setup};
use doged::app_context::SendOutcome;
use doged::chain::{ChainTransaction, ProviderErrorKind};
use doged::tracker::{TxStatus, BASE_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS};
use doged::types::Initiator;

#[tokio::test]
async fn refresh_and_send_survive_primary_outage() {
    let wallet = setup().await;
    wallet.fund("f1", 500).await;

    wallet.primary.fail_all_with(ProviderErrorKind::Transient);

    // refresh succeeds via the fallback provider
    let balance = wallet.context.refresh_utxos().await.unwrap();
    assert_eq!(balance.confirmed, doge(500));

    // and the send path works end to end on the fallback alone
    let outcome = wallet
        .context
        .request_send(&recipient(), 2.0, "during outage", Initiator::Agent)
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Sent(_)));
    assert_eq!(wallet.fallback.calls("broadcast_tx"), 1);

    let health = wallet.context.chain.health_snapshot();
    assert!(!health[0].healthy);
    assert!(health[1].healthy);
}

#[tokio::test]
async fn sustained_rate_limiting_never_false_fails_a_send() {
    let wallet = setup().await;
    wallet.fund("f1", 500).await;

    let txid = match wallet
        .context
        .request_send(&recipient(), 2.0, "watch me", Initiator::Agent)
        .await
        .unwrap()
    {
        SendOutcome::Sent(result) => result.txid,
        other => panic!("expected send, got {other:?}"),
    };

    // both providers start returning 429 for every poll
    wallet.primary.fail_all_with(ProviderErrorKind::RateLimited);
    wallet.fallback.fail_all_with(ProviderErrorKind::RateLimited);

    for _ in 0..30 {
        wallet.context.tracker.poll_one(&txid).await;
        wallet.clock.advance_ms(MAX_POLL_INTERVAL_MS as i64);
    }

    let tracked = wallet.context.tracker.get(&txid).unwrap();
    assert!(matches!(tracked.status, TxStatus::Pending | TxStatus::Confirming));
    assert_eq!(tracked.poll_failures, 0);
    assert_eq!(tracked.api_errors, 30);
    assert_eq!(tracked.poll_interval_ms, MAX_POLL_INTERVAL_MS);
    // inputs stay reserved while the outcome is unknown
    assert!(!wallet.context.utxo_store.locked_outpoints().is_empty());

    // recovery: one good poll resets the degradation state
    wallet.primary.heal();
    wallet.fallback.heal();
    wallet.primary.set_transaction(ChainTransaction {
        txid: txid.clone(),
        confirmations: 2,
        block_height: Some(5_000_050),
        outputs: vec![],
    });
    wallet.context.tracker.poll_one(&txid).await;
    let tracked = wallet.context.tracker.get(&txid).unwrap();
    assert_eq!(tracked.status, TxStatus::Confirming);
    assert_eq!(tracked.api_errors, 0);
    assert_eq!(tracked.poll_interval_ms, BASE_POLL_INTERVAL_MS);
}

#[tokio::test]
async fn network_info_failure_falls_back_to_configured_fee() {
    let wallet = setup().await;
    wallet.fund("f1", 500).await;
    wallet.primary.fail_all_with(ProviderErrorKind::Transient);
    wallet.fallback.fail_all_with(ProviderErrorKind::Transient);
    wallet.primary.heal();
    // primary healthy again but with no fee estimate in network info
    wallet.primary.set_network_info(doged::chain::NetworkInfo {
        height: 5_000_000,
        fee_per_kb: None,
    });

    let outcome = wallet
        .context
        .request_send(&recipient(), 2.0, "fallback fee", Initiator::Agent)
        .await
        .unwrap();
    let result = match outcome {
        SendOutcome::Sent(result) => result,
        other => panic!("expected send, got {other:?}"),
    };
    // fallback_fee_per_kb default is 1_000_000 koinu/kB → 1000 koinu/byte,
    // one input and two outputs estimate at 226 bytes
    assert_eq!(result.fee, 226_000);
}