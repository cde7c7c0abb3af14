//! Wallet event bus.
//!
//! The thin contract between the core and its out-of-scope collaborators
//! (chat notifier, dashboards): core components publish, externals
//! subscribe. Publishing never blocks and never fails; a slow subscriber
//! only lags its own receiver.

use tokio::sync::broadcast;

#[derive(Clone, Debug)]
pub enum WalletEvent {
    /// Inbound payment seen for the wallet address.
    Received {
        txid: String,
        amount: u64,
        confirmations: u32,
    },
    /// Outbound transaction broadcast accepted.
    Sent {
        txid: String,
        to: String,
        amount: u64,
        fee: u64,
    },
    /// Tracked transaction reached the confirmation target.
    Confirmed { txid: String },
    /// Tracked transaction ended as failed or unverified.
    SendFailed { txid: String, terminal: String },
    /// An approval needs the owner's attention.
    ApprovalPending {
        approval_id: String,
        to: String,
        amount: u64,
        action: String,
    },
    /// A2A invoice settled.
    InvoicePaid { invoice_id: String, txid: String },
    /// Keystore auto-locked after inactivity.
    AutoLocked,
    /// Confirmed balance dipped below the configured threshold.
    LowBalance { balance: u64, threshold: u64 },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WalletEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1_024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: WalletEvent) {
        // no subscribers is fine; the daemon may run headless
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(WalletEvent::Confirmed { txid: "aa".into() });
        match rx.recv().await.unwrap() {
            WalletEvent::Confirmed { txid } => assert_eq!(txid, "aa"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(WalletEvent::AutoLocked);
    }
}
