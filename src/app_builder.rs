//! Startup sequence and background tasks.
//!
//! Order matters: load persisted state first, then preflight, then start
//! the timers. Every periodic job is a cancellable task registered with
//! the [`ShutdownManager`] so nothing outlives the daemon.

use std::sync::Arc;
use std::time::Duration;

use crate::app_context::WalletContext;
use crate::error::WalletError;
use crate::events::WalletEvent;
use crate::shutdown::ShutdownManager;
use crate::units::doge_to_koinu;

const RECEIVE_POLL_INTERVAL_SECS: u64 = 30;
const APPROVAL_SWEEP_INTERVAL_SECS: u64 = 30;
const TRACKER_DRIVE_INTERVAL_SECS: u64 = 30;
const INVOICE_CLEANUP_INTERVAL_SECS: u64 = 300;
const PRICE_FETCH_INTERVAL_SECS: u64 = 300;
const AUTO_LOCK_CHECK_INTERVAL_SECS: u64 = 5;

/// Load persistence, run preflight, start every periodic job.
pub async fn start(
    context: Arc<WalletContext>,
    shutdown: &mut ShutdownManager,
) -> Result<(), WalletError> {
    context.load_persistence()?;
    context.preflight().await?;

    if context.keystore.is_initialized() {
        spawn_utxo_refresh(context.clone(), shutdown);
        spawn_receive_poll(context.clone(), shutdown);
        spawn_approval_sweep(context.clone(), shutdown);
        spawn_tracker_drive(context.clone(), shutdown);
        spawn_invoice_cleanup(context.clone(), shutdown);
        spawn_price_fetch(context.clone(), shutdown);
    } else {
        tracing::warn!("Wallet not initialized; pollers idle until init/recover and restart");
    }
    spawn_auto_lock(context.clone(), shutdown);

    tracing::info!("All background tasks started");
    Ok(())
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    shutdown: &mut ShutdownManager,
    mut job: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let token = shutdown.token();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => job().await,
            }
        }
    });
    shutdown.register_task(name, handle);
}

fn spawn_utxo_refresh(context: Arc<WalletContext>, shutdown: &mut ShutdownManager) {
    let interval = Duration::from_secs(context.config.utxo.refresh_interval_seconds);
    let threshold =
        doge_to_koinu(context.config.notifications.low_balance_threshold_doge).unwrap_or(0);
    spawn_periodic("utxo-refresh", interval, shutdown, move || {
        let context = context.clone();
        async move {
            match context.refresh_utxos().await {
                Ok(balance) => {
                    if threshold > 0 && context.alerts.should_alert(balance.confirmed, threshold) {
                        context.events.publish(WalletEvent::LowBalance {
                            balance: balance.confirmed,
                            threshold,
                        });
                    }
                }
                Err(e) => tracing::debug!(error = %e, "UTXO refresh failed"),
            }
        }
    });
}

fn spawn_receive_poll(context: Arc<WalletContext>, shutdown: &mut ShutdownManager) {
    spawn_periodic(
        "receive-poll",
        Duration::from_secs(RECEIVE_POLL_INTERVAL_SECS),
        shutdown,
        move || {
            let context = context.clone();
            async move {
                let Ok(address) = context.keystore.get_address() else {
                    return;
                };
                if let Err(e) = context.receive_monitor.poll(&address).await {
                    tracing::debug!(error = %e, "Receive poll failed");
                }
            }
        },
    );
}

fn spawn_approval_sweep(context: Arc<WalletContext>, shutdown: &mut ShutdownManager) {
    spawn_periodic(
        "approval-sweep",
        Duration::from_secs(APPROVAL_SWEEP_INTERVAL_SECS),
        shutdown,
        move || {
            let context = context.clone();
            async move {
                match context.approvals.expire() {
                    Ok(fired) if !fired.is_empty() => {
                        context.execute_auto_approved(fired).await;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Approval sweep failed"),
                }
                if let Err(e) = context.approvals.cleanup() {
                    tracing::debug!(error = %e, "Approval cleanup failed");
                }
            }
        },
    );
}

fn spawn_tracker_drive(context: Arc<WalletContext>, shutdown: &mut ShutdownManager) {
    spawn_periodic(
        "tracker",
        Duration::from_secs(TRACKER_DRIVE_INTERVAL_SECS),
        shutdown,
        move || {
            let context = context.clone();
            async move {
                context.tracker.poll_due().await;
            }
        },
    );
}

fn spawn_invoice_cleanup(context: Arc<WalletContext>, shutdown: &mut ShutdownManager) {
    spawn_periodic(
        "invoice-cleanup",
        Duration::from_secs(INVOICE_CLEANUP_INTERVAL_SECS),
        shutdown,
        move || {
            let context = context.clone();
            async move {
                context.invoices.cleanup_expired();
            }
        },
    );
}

fn spawn_price_fetch(context: Arc<WalletContext>, shutdown: &mut ShutdownManager) {
    spawn_periodic(
        "price-fetch",
        Duration::from_secs(PRICE_FETCH_INTERVAL_SECS),
        shutdown,
        move || {
            let context = context.clone();
            async move {
                let _ = context.price.refresh().await;
            }
        },
    );
}

fn spawn_auto_lock(context: Arc<WalletContext>, shutdown: &mut ShutdownManager) {
    spawn_periodic(
        "auto-lock",
        Duration::from_secs(AUTO_LOCK_CHECK_INTERVAL_SECS),
        shutdown,
        move || {
            let context = context.clone();
            async move {
                if context.keystore.maybe_auto_lock() {
                    context.events.publish(WalletEvent::AutoLocked);
                }
            }
        },
    );
}
