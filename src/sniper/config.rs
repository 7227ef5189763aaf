use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::OrderType;

/// Burst of the sniper's own placement limiter
pub const SNIPER_LIMITER_BURST: u32 = 20;

/// Sniper settings. Live-updatable through `SniperEngine::update_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SniperConfig {
    /// Quote amount spent per snipe
    pub max_buy_amount: f64,
    pub max_price_per_token: f64,
    pub max_slippage_pct: f64,
    pub preferred_order_type: OrderType,
    pub max_concurrent_orders: usize,
    /// Placement attempts at the strategy layer, on top of executor retries
    pub retry_attempts: u32,
    #[serde(rename = "retry_delay_ms", with = "crate::config::duration_ms")]
    pub retry_delay: Duration,
    pub enable_take_profit: bool,
    pub take_profit_pct: f64,
    pub enable_stop_loss: bool,
    pub stop_loss_pct: f64,
    #[serde(rename = "price_cache_ttl_ms", with = "crate::config::duration_ms")]
    pub price_cache_ttl: Duration,
    pub rate_limit_per_sec: f64,
}

impl Default for SniperConfig {
    fn default() -> Self {
        Self {
            max_buy_amount: 100.0,
            max_price_per_token: 1.0,
            max_slippage_pct: 5.0,
            preferred_order_type: OrderType::Market,
            max_concurrent_orders: 3,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(100),
            enable_take_profit: false,
            take_profit_pct: 20.0,
            enable_stop_loss: false,
            stop_loss_pct: 10.0,
            price_cache_ttl: Duration::from_millis(500),
            rate_limit_per_sec: 10.0,
        }
    }
}

impl SniperConfig {
    pub fn validate(&self) -> Result<(), String> {
        let numeric = [
            ("max_buy_amount", self.max_buy_amount),
            ("max_price_per_token", self.max_price_per_token),
            ("max_slippage_pct", self.max_slippage_pct),
            ("take_profit_pct", self.take_profit_pct),
            ("stop_loss_pct", self.stop_loss_pct),
            ("rate_limit_per_sec", self.rate_limit_per_sec),
        ];
        for (name, value) in numeric {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{} must be a non-negative number, got {}", name, value));
            }
        }

        if self.max_concurrent_orders < 1 {
            return Err("max_concurrent_orders must be at least 1".to_string());
        }
        if self.rate_limit_per_sec <= 0.0 {
            return Err("rate_limit_per_sec must be positive".to_string());
        }
        if self.max_price_per_token <= 0.0 {
            return Err("max_price_per_token must be positive".to_string());
        }
        if self.preferred_order_type == OrderType::StopLoss {
            return Err("preferred_order_type must be MARKET or LIMIT".to_string());
        }
        if self.stop_loss_pct >= 100.0 {
            return Err(format!("stop_loss_pct must be below 100, got {}", self.stop_loss_pct));
        }

        Ok(())
    }

    /// Placement attempts, never less than one
    pub fn placement_attempts(&self) -> u32 {
        self.retry_attempts.max(1)
    }

    pub fn wants_post_trade(&self) -> bool {
        self.enable_take_profit || self.enable_stop_loss
    }

    pub fn take_profit_price(&self, filled_price: f64) -> f64 {
        filled_price * (1.0 + self.take_profit_pct / 100.0)
    }

    pub fn stop_loss_price(&self, filled_price: f64) -> f64 {
        filled_price * (1.0 - self.stop_loss_pct / 100.0)
    }
}
