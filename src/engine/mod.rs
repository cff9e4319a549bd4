//! Trade signal orchestration.
//!
//! One worker task per inbound signal; the pipeline is
//! quote -> simulate -> nonce -> sign -> broadcast -> ledger, with nonce
//! reservation as the only step serialized across workers.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::SolCall;
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::abi::IERC20;
use crate::chain::{ChainConfig, ChainRegistry};
use crate::error::{EngineError, Result};
use crate::executor::SwapExecutor;
use crate::ledger::TradeLedger;
use crate::models::{u256_to_decimal, Quote, TradeDirection, TradeSignal, TxStatus};
use crate::quote::QuoteEstimator;
use crate::rpc::EthRpc;

/// Result of a processed trade signal.
#[derive(Debug, Clone)]
pub struct TradeOutcome {
    pub signal_id: String,
    pub direction: TradeDirection,
    pub contract: Address,
    pub hash: B256,
    /// `Pending` unless the engine was configured to await inclusion
    pub status: TxStatus,
}

/// The trade execution engine, generic over the chain transport.
pub struct Engine<R: EthRpc> {
    registry: Arc<ChainRegistry>,
    rpcs: HashMap<String, Arc<R>>,
    keyring: HashMap<String, PrivateKeySigner>,
    estimator: QuoteEstimator,
    executor: SwapExecutor,
    ledger: Arc<TradeLedger>,
    /// Block each worker until its swap is mined before recording it
    wait_for_confirmation: bool,
}

impl<R: EthRpc + 'static> Engine<R> {
    pub fn new(
        registry: Arc<ChainRegistry>,
        rpcs: HashMap<String, Arc<R>>,
        keyring: HashMap<String, PrivateKeySigner>,
        estimator: QuoteEstimator,
        executor: SwapExecutor,
        ledger: Arc<TradeLedger>,
        wait_for_confirmation: bool,
    ) -> Self {
        Self {
            registry,
            rpcs,
            keyring,
            estimator,
            executor,
            ledger,
            wait_for_confirmation,
        }
    }

    pub fn ledger(&self) -> &TradeLedger {
        &self.ledger
    }

    /// Execute one trade signal end to end.
    pub async fn process_signal(&self, signal: &TradeSignal) -> Result<TradeOutcome> {
        let chain = self.registry.resolve(&signal.chain)?;
        let rpc = self
            .rpcs
            .get(&signal.chain)
            .ok_or_else(|| EngineError::UnsupportedChain(signal.chain.clone()))?;
        let signer = self
            .keyring
            .get(&signal.account)
            .ok_or_else(|| EngineError::UnknownAccount(signal.account.clone()))?;

        info!(
            signal = %signal.id,
            chain = %signal.chain,
            direction = signal.direction.as_str(),
            token = %signal.token,
            amount = %signal.amount,
            "Processing trade signal"
        );

        match signal.direction {
            TradeDirection::Buy => self.execute_buy(rpc.as_ref(), chain, signer, signal).await,
            TradeDirection::Sell => self.execute_sell(rpc.as_ref(), chain, signer, signal).await,
        }
    }

    async fn execute_buy(
        &self,
        rpc: &R,
        chain: &ChainConfig,
        signer: &PrivateKeySigner,
        signal: &TradeSignal,
    ) -> Result<TradeOutcome> {
        // A second buy while the position is still open is an ordering
        // error; catch it before any gas is spent, like the sell side
        // catches a missing position.
        match self.ledger.find_buy_by_contract(signal.token).await {
            Ok(_) => {
                return Err(EngineError::DuplicateContract(format!(
                    "{:#x}",
                    signal.token
                )))
            }
            Err(EngineError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let quote = self
            .estimator
            .estimate(
                rpc,
                chain,
                [chain.wrapped_native, signal.token],
                signal.amount,
                signal.slippage_pct,
            )
            .await?;

        let hash = self
            .executor
            .swap_native_for_token(
                rpc,
                chain,
                signer,
                signal.token,
                signal.amount,
                quote.minimum_out,
            )
            .await?;

        let status = self.resolve_status(rpc, hash).await?;

        let (token_name, ticker) = self.token_metadata(rpc, signal.token).await;
        let entry_price = usd_price_f64(&quote);
        self.ledger
            .record_buy(signal.token, &token_name, &ticker, entry_price, hash)
            .await?;

        Ok(TradeOutcome {
            signal_id: signal.id.clone(),
            direction: TradeDirection::Buy,
            contract: signal.token,
            hash,
            status,
        })
    }

    async fn execute_sell(
        &self,
        rpc: &R,
        chain: &ChainConfig,
        signer: &PrivateKeySigner,
        signal: &TradeSignal,
    ) -> Result<TradeOutcome> {
        // A sell with no open position is an ordering error; catch it
        // before spending gas on an approval.
        let position = self
            .ledger
            .find_buy_by_contract(signal.token)
            .await
            .map_err(|e| match e {
                EngineError::NotFound(contract) => EngineError::NoOpenPosition(contract),
                other => other,
            })?;
        debug!(
            contract = %position.contract_address,
            entry_price = position.entry_price,
            "Selling against open position"
        );

        // A zero amount means "sell the whole position", sized from the
        // live token balance.
        let amount = if signal.amount.is_zero() {
            let balance = self
                .token_balance(rpc, signal.token, signer.address())
                .await?;
            if balance.is_zero() {
                return Err(EngineError::NoOpenPosition(format!("{:#x}", signal.token)));
            }
            balance
        } else {
            signal.amount
        };

        self.executor
            .approve(rpc, chain, signer, signal.token, chain.router, amount)
            .await?;

        let quote = self
            .estimator
            .estimate(
                rpc,
                chain,
                [signal.token, chain.wrapped_native],
                amount,
                signal.slippage_pct,
            )
            .await?;

        let hash = self
            .executor
            .swap_token_for_native(
                rpc,
                chain,
                signer,
                signal.token,
                amount,
                Some(quote.minimum_out),
            )
            .await?;

        let status = self.resolve_status(rpc, hash).await?;

        let exit_price = usd_price_f64(&quote);
        let quantity = u256_to_decimal(amount)
            .and_then(|d| d.to_f64())
            .unwrap_or(0.0);
        self.ledger
            .record_sell(signal.token, exit_price, quantity, hash)
            .await?;

        Ok(TradeOutcome {
            signal_id: signal.id.clone(),
            direction: TradeDirection::Sell,
            contract: signal.token,
            hash,
            status,
        })
    }

    /// Either wait for inclusion (and fail on a reverted receipt) or
    /// leave the transaction pending for a later `confirm`.
    ///
    /// A polling failure degrades to `Pending` instead of erroring: the
    /// swap was already broadcast and may well be mined, so the signal
    /// must still reach the ledger.
    async fn resolve_status(&self, rpc: &R, hash: B256) -> Result<TxStatus> {
        if !self.wait_for_confirmation {
            return Ok(TxStatus::Pending);
        }
        match self.executor.wait_for_confirmation(rpc, hash).await {
            Ok(TxStatus::Reverted) => Err(EngineError::SwapReverted { hash }),
            Ok(status) => Ok(status),
            Err(e) => {
                warn!(hash = %hash, error = %e, "Receipt polling failed, recording as pending");
                Ok(TxStatus::Pending)
            }
        }
    }

    /// ERC-20 balance of `owner`, used to size full-position sells.
    async fn token_balance(&self, rpc: &R, token: Address, owner: Address) -> Result<U256> {
        let data = IERC20::balanceOfCall { owner }.abi_encode();
        let returned = rpc
            .call(token, U256::ZERO, data.into())
            .await
            .map_err(|e| EngineError::Rpc(e.to_string()))?;
        IERC20::balanceOfCall::abi_decode_returns(&returned, true)
            .map(|r| r._0)
            .map_err(|e| EngineError::AbiEncodingFailure {
                function: "balanceOf",
                message: e.to_string(),
            })
    }

    /// Best-effort ERC-20 name/symbol lookup for ledger display.
    async fn token_metadata(&self, rpc: &R, token: Address) -> (String, String) {
        let name = self
            .erc20_string(rpc, token, IERC20::nameCall {}.abi_encode(), "name")
            .await;
        let symbol = self
            .erc20_string(rpc, token, IERC20::symbolCall {}.abi_encode(), "symbol")
            .await;
        (name, symbol)
    }

    async fn erc20_string(
        &self,
        rpc: &R,
        token: Address,
        data: Vec<u8>,
        what: &'static str,
    ) -> String {
        let Ok(returned) = rpc.call(token, U256::ZERO, data.into()).await else {
            debug!(token = %token, what = what, "Token metadata unavailable");
            return String::new();
        };
        match what {
            "name" => IERC20::nameCall::abi_decode_returns(&returned, true)
                .map(|r| r._0)
                .unwrap_or_default(),
            _ => IERC20::symbolCall::abi_decode_returns(&returned, true)
                .map(|r| r._0)
                .unwrap_or_default(),
        }
    }

    /// Consume signals until the channel closes, one worker per signal.
    pub async fn run(self: Arc<Self>, mut signals: mpsc::Receiver<TradeSignal>) {
        let mut workers = JoinSet::new();

        while let Some(signal) = signals.recv().await {
            let engine = Arc::clone(&self);
            workers.spawn(async move {
                let id = signal.id.clone();
                match engine.process_signal(&signal).await {
                    Ok(outcome) => {
                        info!(
                            signal = %id,
                            hash = %outcome.hash,
                            direction = outcome.direction.as_str(),
                            "Trade executed"
                        );
                    }
                    Err(e) => {
                        error!(
                            signal = %id,
                            stage = e.stage().as_str(),
                            retry_safe = e.retry_safe(),
                            error = %e,
                            "Trade failed"
                        );
                    }
                }
            });
        }

        while workers.join_next().await.is_some() {}
    }
}

fn usd_price_f64(quote: &Quote) -> f64 {
    quote
        .usd_reference
        .and_then(|price| price.to_f64())
        .unwrap_or(0.0)
}
