use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Interval between full cache purges while the sniper runs
pub const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy)]
struct CachedPrice {
    price: f64,
    fetched_at: Instant,
}

/// Symbol validity and last-price caches
///
/// Entries are never evicted one by one; prices expire through the TTL
/// check and the whole cache is wiped periodically.
#[derive(Debug, Default)]
pub struct SniperCaches {
    symbols: DashMap<String, bool>,
    prices: DashMap<String, CachedPrice>,
}

impl SniperCaches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn symbol_validity(&self, symbol: &str) -> Option<bool> {
        self.symbols.get(symbol).map(|entry| *entry.value())
    }

    pub fn store_symbol_validity(&self, symbol: &str, valid: bool) {
        self.symbols.insert(symbol.to_string(), valid);
    }

    /// Cached price if it is younger than `ttl`
    pub fn fresh_price(&self, symbol: &str, ttl: Duration) -> Option<f64> {
        let entry = self.prices.get(symbol)?;
        (entry.fetched_at.elapsed() < ttl).then_some(entry.price)
    }

    pub fn store_price(&self, symbol: &str, price: f64) {
        self.prices.insert(
            symbol.to_string(),
            CachedPrice {
                price,
                fetched_at: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        self.symbols.clear();
        self.prices.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.symbols.len() + self.prices.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
