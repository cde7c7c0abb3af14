//! Daemon teardown.
//!
//! Stopping a wallet is ordered work, not just killing tasks: the pollers
//! must stop taking on new sends before anything is flushed, the rate-limit
//! and spend-counter windows must reach disk so a restart cannot reset
//! them, and the keystore must end locked. [`ShutdownManager`] owns that
//! sequence. Background tasks register by name so a straggler that misses
//! the drain deadline is identifiable in the logs.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app_context::WalletContext;

/// How long the drain phase waits for all background tasks together.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

struct NamedTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

pub struct ShutdownManager {
    cancel: CancellationToken,
    tasks: Vec<NamedTask>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Token every background task selects on.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register a spawned task under a name for drain reporting.
    pub fn register_task(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.push(NamedTask { name, handle });
    }

    /// Block until ctrl-c, then run the teardown sequence. If the signal
    /// handler cannot be installed the sequence still runs, so the wallet
    /// never exits with unflushed counters or an unlocked keystore.
    pub async fn wait_for_shutdown(self, context: Arc<WalletContext>) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown requested"),
            Err(e) => tracing::error!(error = %e, "Signal handler failed; shutting down now"),
        }
        self.finish(context).await;
    }

    /// The teardown sequence: cancel → drain → flush → lock.
    pub async fn finish(mut self, context: Arc<WalletContext>) {
        // 1. stop the pollers and sweepers; nothing new enters the pipeline
        self.cancel.cancel();

        // 2. drain all tasks against one shared deadline
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        let mut stragglers: Vec<&'static str> = Vec::new();
        for task in self.tasks.drain(..) {
            match tokio::time::timeout_at(deadline, task.handle).await {
                Ok(_) => tracing::debug!(task = task.name, "Task stopped"),
                Err(_) => stragglers.push(task.name),
            }
        }
        if stragglers.is_empty() {
            tracing::info!("All background tasks stopped");
        } else {
            tracing::warn!(?stragglers, "Tasks still running at the drain deadline");
        }

        // 3. window state is the only persistence that is not written
        // through on every mutation; flush it now
        context.rate_limiter.persist();
        context.spend_tracker.persist();

        // 4. no key material survives the process
        context.keystore.lock();
        tracing::info!("Wallet state flushed, keystore locked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockProvider;
    use crate::chain::{ChainProvider, FailoverChain};
    use crate::clock::system_clock;
    use crate::config::Config;
    use tempfile::TempDir;

    fn context_in(dir: &TempDir) -> Arc<WalletContext> {
        let mut config = Config::default();
        config.data_dir = dir.path().to_string_lossy().to_string();
        let provider = Arc::new(MockProvider::new());
        let chain = Arc::new(FailoverChain::new(
            vec![provider as Arc<dyn ChainProvider>],
            system_clock(),
        ));
        WalletContext::build_with_chain(config, system_clock(), chain).unwrap()
    }

    #[tokio::test]
    async fn finish_drains_tasks_and_locks_keystore() {
        let dir = TempDir::new().unwrap();
        let context = context_in(&dir);
        context.init_wallet("pass").unwrap();
        assert!(context.keystore.is_unlocked());

        let mut shutdown = ShutdownManager::new();
        let token = shutdown.token();
        shutdown.register_task(
            "ticker",
            tokio::spawn(async move { token.cancelled().await }),
        );

        shutdown.finish(context.clone()).await;
        assert!(!context.keystore.is_unlocked());
        // the flushed rate-limit state is on disk
        assert!(dir.path().join(crate::security::RATE_LIMIT_FILE).exists());
    }

    #[tokio::test]
    async fn finish_with_no_tasks_still_flushes() {
        let dir = TempDir::new().unwrap();
        let context = context_in(&dir);
        context.init_wallet("pass").unwrap();

        ShutdownManager::new().finish(context.clone()).await;
        assert!(!context.keystore.is_unlocked());
        assert!(dir.path().join(crate::policy::LIMITS_FILE).exists());
    }
}
