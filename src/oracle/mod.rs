//! Spot-price oracle client.
//!
//! One HTTP GET against a CoinGecko-style endpoint returning
//! `{ "<asset>": { "usd": <number> } }`. Strictly best-effort: the USD
//! reference only feeds operator-facing PnL display, so any failure
//! degrades to `None` and never gates trade execution.

use std::collections::HashMap;
use std::time::Duration;

use alloy_primitives::U256;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::warn;

use crate::models::{u256_to_decimal, wei_to_eth};

const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";
const ORACLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct AssetPrice {
    usd: Decimal,
}

/// Read-only price feed client.
pub struct PriceOracle {
    client: Client,
    base_url: String,
}

impl PriceOracle {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL.to_string())
    }

    /// Custom base URL (for testing).
    pub fn with_base_url(base_url: String) -> Self {
        let client = Client::builder()
            .timeout(ORACLE_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self { client, base_url }
    }

    /// USD price of an asset (e.g. "ethereum"). None on any failure.
    pub async fn usd_price(&self, asset: &str) -> Option<Decimal> {
        let url = format!(
            "{}/simple/price?ids={}&vs_currencies=usd",
            self.base_url, asset
        );

        let response = match self.client.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(asset = asset, status = %r.status(), "Price feed returned error status");
                return None;
            }
            Err(e) => {
                warn!(asset = asset, error = %e, "Price feed unreachable");
                return None;
            }
        };

        let body: HashMap<String, AssetPrice> = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                warn!(asset = asset, error = %e, "Malformed price feed response");
                return None;
            }
        };

        body.get(asset).map(|p| p.usd)
    }
}

impl Default for PriceOracle {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-token USD price implied by a swap: the USD value of the native
/// side divided by the token amount on the other side.
pub fn token_price_usd(
    amount_native_wei: U256,
    amount_tokens: U256,
    native_usd: Decimal,
) -> Option<Decimal> {
    if amount_tokens.is_zero() {
        return None;
    }
    let native = wei_to_eth(amount_native_wei)?;
    let tokens = u256_to_decimal(amount_tokens)?;
    (native * native_usd).checked_div(tokens)
}
