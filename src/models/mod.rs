//! Core data types for the trade execution engine.

use alloy_primitives::{Address, U256};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a trade signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeDirection {
    Buy,
    Sell,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::Buy => "BUY",
            TradeDirection::Sell => "SELL",
        }
    }
}

/// Inbound signal from the wallet watcher: "tracked wallet bought/sold
/// token X, replicate it".
///
/// `amount` is wei of the native asset for a BUY and token base units
/// for a SELL; a zero SELL amount means the whole position, sized from
/// the live token balance. `account` names an entry in the engine's
/// keyring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    /// Unique signal identifier
    #[serde(default = "new_signal_id")]
    pub id: String,

    /// Registered chain name (e.g. "base")
    pub chain: String,

    /// Trade direction
    pub direction: TradeDirection,

    /// Token contract address
    pub token: Address,

    /// Input amount (native wei for BUY, token units for SELL)
    pub amount: U256,

    /// Slippage tolerance as a percentage, 0 <= s < 100
    pub slippage_pct: Decimal,

    /// Signing account reference
    pub account: String,
}

fn new_signal_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl TradeSignal {
    pub fn new(
        chain: impl Into<String>,
        direction: TradeDirection,
        token: Address,
        amount: U256,
        slippage_pct: Decimal,
        account: impl Into<String>,
    ) -> Self {
        Self {
            id: new_signal_id(),
            chain: chain.into(),
            direction,
            token,
            amount,
            slippage_pct,
            account: account.into(),
        }
    }
}

/// Swap quote, recomputed per signal. Never cached: reserves shift every
/// block and a stale minimum-out bound is worse than none.
#[derive(Debug, Clone)]
pub struct Quote {
    /// Expected output from current reserves
    pub expected_out: U256,

    /// Minimum acceptable output after slippage
    pub minimum_out: U256,

    /// USD reference price per output token, display-only
    pub usd_reference: Option<Decimal>,
}

/// A nonce-bearing transaction between reservation and broadcast
/// resolution.
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    pub chain: String,
    pub account: Address,
    pub nonce: u64,
    pub raw: Vec<u8>,
    pub submitted_at: DateTime<Utc>,
}

/// Outcome of an idempotent confirmation query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Success,
    Reverted,
}

const WEI_PER_ETH: u128 = 1_000_000_000_000_000_000;

/// Convert a decimal native-asset amount (e.g. 0.1 ETH) to wei.
/// Returns None for negative amounts or amounts past u128 range.
pub fn eth_to_wei(amount: Decimal) -> Option<U256> {
    if amount.is_sign_negative() {
        return None;
    }
    let wei = (amount * Decimal::from(WEI_PER_ETH)).trunc();
    wei.to_u128().map(U256::from)
}

/// Convert wei to a decimal native-asset amount for display. Returns
/// None when the value exceeds u128 (beyond any plausible balance).
pub fn wei_to_eth(wei: U256) -> Option<Decimal> {
    let v: u128 = wei.try_into().ok()?;
    Some(Decimal::from(v) / Decimal::from(WEI_PER_ETH))
}

/// Convert a U256 token amount to Decimal, if it fits.
pub fn u256_to_decimal(v: U256) -> Option<Decimal> {
    let v: u128 = v.try_into().ok()?;
    Decimal::try_from(v).ok()
}
