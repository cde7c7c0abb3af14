//! A2A invoice lifecycle against the full context: issue, settle on-chain,
//! replay resistance, receive-monitor dedup.

mod common;

use common::setup;
use doged::audit::AuditAction;
use doged::chain::{ChainTransaction, ChainTxOutput};
use doged::error::WalletError;
use doged::invoice::{CreateInvoiceOptions, InvoiceStatus, OP_RETURN_PREFIX};
use doged::script::op_return_script;
use doged::types::Initiator;

fn settlement_tx(
    txid: &str,
    invoice_id: &str,
    pay_to: &str,
    amount: u64,
    confirmations: u32,
) -> ChainTransaction {
    let marker = format!("{OP_RETURN_PREFIX}{invoice_id}");
    ChainTransaction {
        txid: txid.to_string(),
        confirmations,
        block_height: Some(5_000_001),
        outputs: vec![
            ChainTxOutput {
                vout: 0,
                value: amount,
                script_pubkey: String::new(),
                address: Some(pay_to.to_string()),
            },
            ChainTxOutput {
                vout: 1,
                value: 0,
                script_pubkey: hex::encode(op_return_script(marker.as_bytes()).unwrap()),
                address: None,
            },
        ],
    }
}

#[tokio::test]
async fn invoice_paid_then_replay_ignored() {
    let wallet = setup().await;

    let invoice = wallet
        .context
        .create_invoice(5.0, "api credits", CreateInvoiceOptions::default(), None)
        .unwrap();
    assert_eq!(invoice.payee.address, wallet.address);
    assert_eq!(invoice.status, InvoiceStatus::Pending);

    wallet.primary.set_transaction(settlement_tx(
        "feedbeef",
        &invoice.invoice_id,
        &wallet.address,
        500_000_000,
        6,
    ));

    let result = wallet
        .context
        .verify_invoice_payment(&invoice.invoice_id, "feedbeef", 5.0, Some("peer-agent"))
        .await
        .unwrap();
    assert!(result.valid, "{:?}", result.reason);
    assert!(result.op_return_match);
    assert_eq!(result.amount_received, 500_000_000);

    let paid = wallet.context.invoices.get_invoice(&invoice.invoice_id).unwrap();
    assert_eq!(paid.status, InvoiceStatus::Paid);
    assert_eq!(paid.txid.as_deref(), Some("feedbeef"));

    // replay: same invoice, same proof — refused
    let replay = wallet
        .context
        .verify_invoice_payment(&invoice.invoice_id, "feedbeef", 5.0, Some("peer-agent"))
        .await
        .unwrap();
    assert!(!replay.valid);
    assert_eq!(replay.reason.as_deref(), Some("INVOICE_NOT_PENDING"));

    // audit shows exactly one settlement
    let audit = wallet.context.audit.read_all().unwrap();
    let paid_entries = audit
        .iter()
        .filter(|e| e.action == AuditAction::InvoicePaid)
        .count();
    assert_eq!(paid_entries, 1);
}

#[tokio::test]
async fn testnet_needs_single_confirmation() {
    let wallet = setup().await;
    let invoice = wallet
        .context
        .create_invoice(1.0, "ping", CreateInvoiceOptions::default(), None)
        .unwrap();

    wallet.primary.set_transaction(settlement_tx(
        "aa11",
        &invoice.invoice_id,
        &wallet.address,
        100_000_000,
        1,
    ));
    let result = wallet
        .context
        .verify_invoice_payment(&invoice.invoice_id, "aa11", 1.0, None)
        .await
        .unwrap();
    assert!(result.valid, "{:?}", result.reason);
}

#[tokio::test]
async fn invoice_issuance_works_while_locked() {
    // issuing needs only the receiving address, never the private key
    let wallet = setup().await;
    wallet.context.lock();
    wallet
        .context
        .create_invoice(2.0, "locked is fine", CreateInvoiceOptions::default(), None)
        .unwrap();
}

#[tokio::test]
async fn invoice_rate_limit_applies_per_subject() {
    let wallet = setup().await;
    // the default invoice_create window allows 60/hour; exhaust it
    for i in 0..60 {
        wallet
            .context
            .create_invoice(1.0, &format!("bulk {i}"), CreateInvoiceOptions::default(), Some("spammer"))
            .unwrap();
    }
    let err = wallet
        .context
        .create_invoice(1.0, "one too many", CreateInvoiceOptions::default(), Some("spammer"))
        .unwrap_err();
    assert!(matches!(err, WalletError::RateLimited { .. }));

    // other subjects are unaffected
    wallet
        .context
        .create_invoice(1.0, "different peer", CreateInvoiceOptions::default(), Some("friend"))
        .unwrap();
}

#[tokio::test]
async fn inbound_payment_event_fires_once() {
    let wallet = setup().await;
    let mut events = wallet.context.events.subscribe();

    wallet.primary.set_address_transactions(vec![ChainTransaction {
        txid: "inbound1".to_string(),
        confirmations: 2,
        block_height: Some(5_000_002),
        outputs: vec![ChainTxOutput {
            vout: 0,
            value: 700_000_000,
            script_pubkey: String::new(),
            address: Some(wallet.address.clone()),
        }],
    }]);

    assert_eq!(wallet.context.receive_monitor.poll(&wallet.address).await.unwrap(), 1);
    assert_eq!(wallet.context.receive_monitor.poll(&wallet.address).await.unwrap(), 0);

    match events.recv().await.unwrap() {
        doged::events::WalletEvent::Received { txid, amount, .. } => {
            assert_eq!(txid, "inbound1");
            assert_eq!(amount, 700_000_000);
        }
        other => panic!("unexpected {other:?}"),
    }

    let receive_entries = wallet
        .context
        .audit
        .read_all()
        .unwrap()
        .into_iter()
        .filter(|e| e.action == AuditAction::Receive && e.initiated_by == Initiator::External)
        .count();
    assert_eq!(receive_entries, 1);
}
