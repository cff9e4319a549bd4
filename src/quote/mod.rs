//! Quote estimation: constant-product output simulation plus the
//! slippage-derived minimum-output bound.
//!
//! Output is read from the router's own `getAmountsOut` on every call.
//! There is deliberately no reserve cache here: reserves move every
//! block, and a minimum-out bound computed from stale reserves defeats
//! the point of having one.

use alloy_primitives::{Address, U256};
use alloy_sol_types::SolCall;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, warn};

use crate::abi::IUniswapV2Router;
use crate::chain::ChainConfig;
use crate::error::{EngineError, Result};
use crate::models::Quote;
use crate::oracle::{token_price_usd, PriceOracle};
use crate::rpc::{EthRpc, RpcError};

/// CoinGecko asset id used for the native-asset leg of USD pricing.
const NATIVE_ASSET_ID: &str = "ethereum";

/// Minimum acceptable output: `expected × (1 − slippage/100)`, exact to
/// a ten-thousandth of a percent. Slippage must be in [0, 100).
pub fn minimum_output(expected: U256, slippage_pct: Decimal) -> Result<U256> {
    if slippage_pct.is_sign_negative() || slippage_pct >= dec!(100) {
        return Err(EngineError::InvalidSlippage(slippage_pct));
    }

    // keep fraction scaled to millionths: (100 - s)/100 * 1e6
    let keep_ppm = ((dec!(100) - slippage_pct) * dec!(10_000))
        .trunc()
        .to_u64()
        .ok_or(EngineError::InvalidSlippage(slippage_pct))?;

    Ok(expected * U256::from(keep_ppm) / U256::from(1_000_000u64))
}

/// Computes expected swap output and the slippage-bounded minimum,
/// tagging quotes with a best-effort USD reference price.
pub struct QuoteEstimator {
    oracle: PriceOracle,
}

impl QuoteEstimator {
    pub fn new(oracle: PriceOracle) -> Self {
        Self { oracle }
    }

    /// Estimate a single-path swap on `chain`.
    ///
    /// Fails with `InsufficientLiquidity` when the router cannot price
    /// the path (empty or missing reserves); a price-feed failure only
    /// drops the USD reference, never the quote.
    pub async fn estimate<R: EthRpc>(
        &self,
        rpc: &R,
        chain: &ChainConfig,
        path: [Address; 2],
        amount_in: U256,
        slippage_pct: Decimal,
    ) -> Result<Quote> {
        let call = IUniswapV2Router::getAmountsOutCall {
            amountIn: amount_in,
            path: path.to_vec(),
        };

        let returned = rpc
            .call(chain.router, U256::ZERO, call.abi_encode().into())
            .await
            .map_err(|e| match e {
                // The router reverts on zero reserves; anything else the
                // node rejects for this read is equally unquotable.
                RpcError::Node { .. } => EngineError::InsufficientLiquidity {
                    chain: chain.name.clone(),
                    token_in: path[0],
                    token_out: path[1],
                },
                other => EngineError::Rpc(other.to_string()),
            })?;

        let amounts = IUniswapV2Router::getAmountsOutCall::abi_decode_returns(&returned, true)
            .map_err(|e| EngineError::AbiEncodingFailure {
                function: "getAmountsOut",
                message: e.to_string(),
            })?
            .amounts;

        let expected_out = amounts.last().copied().unwrap_or(U256::ZERO);
        if expected_out.is_zero() {
            return Err(EngineError::InsufficientLiquidity {
                chain: chain.name.clone(),
                token_in: path[0],
                token_out: path[1],
            });
        }

        let minimum_out = minimum_output(expected_out, slippage_pct)?;
        debug!(
            chain = %chain.name,
            expected = %expected_out,
            minimum = %minimum_out,
            slippage = %slippage_pct,
            "Quoted swap"
        );

        let usd_reference = self.usd_reference(chain, path, amount_in, expected_out).await;

        Ok(Quote {
            expected_out,
            minimum_out,
            usd_reference,
        })
    }

    /// USD price per token implied by the quote. Display-only; returns
    /// None when the feed is down or the path has no native leg.
    async fn usd_reference(
        &self,
        chain: &ChainConfig,
        path: [Address; 2],
        amount_in: U256,
        expected_out: U256,
    ) -> Option<Decimal> {
        let (native_wei, token_units) = if path[0] == chain.wrapped_native {
            (amount_in, expected_out)
        } else if path[1] == chain.wrapped_native {
            (expected_out, amount_in)
        } else {
            return None;
        };

        let native_usd = self.oracle.usd_price(NATIVE_ASSET_ID).await;
        let Some(native_usd) = native_usd else {
            warn!(chain = %chain.name, "Price feed unavailable, USD reference degraded");
            return None;
        };

        token_price_usd(native_wei, token_units, native_usd)
    }
}
