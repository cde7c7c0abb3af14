//! DOGE/USD price cache.
//!
//! Refreshes on a timer, caches the quote under a TTL, and tolerates
//! outages: everything that consumes a price treats it as optional
//! decoration (audit metadata, owner-facing amounts), never as input to
//! money movement.

use parking_lot::Mutex;
use std::time::Duration;

use crate::clock::SharedClock;

#[derive(Clone, Copy, Debug)]
pub struct PriceQuote {
    pub usd_per_doge: f64,
    /// Unix ms when fetched.
    pub fetched_at: i64,
}

pub struct PriceFetcher {
    base_url: String,
    cache_ttl_ms: i64,
    client: reqwest::Client,
    clock: SharedClock,
    cached: Mutex<Option<PriceQuote>>,
}

impl PriceFetcher {
    pub fn new(base_url: String, cache_ttl_seconds: u64, clock: SharedClock) -> Self {
        Self {
            base_url,
            cache_ttl_ms: cache_ttl_seconds as i64 * 1000,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("reqwest client"),
            clock,
            cached: Mutex::new(None),
        }
    }

    /// Cached quote if still within TTL.
    pub fn cached(&self) -> Option<PriceQuote> {
        let cached = *self.cached.lock();
        cached.filter(|q| self.clock.now_ms() - q.fetched_at < self.cache_ttl_ms)
    }

    /// Cached-or-fetch. Returns `None` when the price API is unreachable;
    /// callers must cope.
    pub async fn get(&self) -> Option<PriceQuote> {
        if let Some(quote) = self.cached() {
            return Some(quote);
        }
        self.refresh().await
    }

    /// Force a fetch. Driven by the orchestrator timer.
    pub async fn refresh(&self) -> Option<PriceQuote> {
        let url = format!(
            "{}/simple/price?ids=dogecoin&vs_currencies=usd",
            self.base_url.trim_end_matches('/')
        );
        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(err) => {
                tracing::debug!(%err, "Price fetch failed");
                return None;
            }
        };
        let json: serde_json::Value = match response.json().await {
            Ok(j) => j,
            Err(err) => {
                tracing::debug!(%err, "Price response unparsable");
                return None;
            }
        };
        let usd = json.get("dogecoin")?.get("usd")?.as_f64()?;
        if !usd.is_finite() || usd <= 0.0 {
            tracing::debug!(usd, "Price response out of range");
            return None;
        }
        let quote = PriceQuote {
            usd_per_doge: usd,
            fetched_at: self.clock.now_ms(),
        };
        *self.cached.lock() = Some(quote);
        tracing::debug!(usd, "Price refreshed");
        Some(quote)
    }

    /// Test hook: seed the cache directly.
    pub fn seed(&self, usd_per_doge: f64) {
        *self.cached.lock() = Some(PriceQuote {
            usd_per_doge,
            fetched_at: self.clock.now_ms(),
        });
    }
}
