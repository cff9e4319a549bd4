//! Swap execution: encode, estimate, sign, broadcast.
//!
//! All three transaction kinds (token approval, native->token swap,
//! token->native swap) follow the same protocol: encode call data,
//! estimate gas by simulating against current state, reserve a nonce,
//! sign with the chain's id, broadcast, and resolve the nonce according
//! to the outcome. Gas price is fetched fresh per transaction.
//!
//! Nothing here retries. Retry policy belongs to the caller: a blind
//! retry of a transaction that already landed is a double execution.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy_eips::eip2718::Encodable2718;
use alloy_network::TxSignerSync;
use alloy_primitives::{Address, Bytes, TxKind, B256, U256};
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::SolCall;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::abi::{IERC20, IUniswapV2Router};
use crate::chain::ChainConfig;
use crate::error::{EngineError, Result};
use crate::models::{PendingTransaction, TxStatus};
use crate::nonce::NonceSequencer;
use crate::rpc::{EthRpc, RpcError};

/// Router-enforced transaction deadline: bounds how long a stale quote
/// can sit exploitable in the mempool.
const SWAP_DEADLINE_SECS: u64 = 600;

const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(90);
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Parse a hex private key (with or without 0x prefix) into a signer.
pub fn parse_signer(private_key: &str) -> Result<PrivateKeySigner> {
    let key = private_key.strip_prefix("0x").unwrap_or(private_key);
    PrivateKeySigner::from_str(key).map_err(|e| EngineError::KeyParseFailure(e.to_string()))
}

struct TxRequest {
    to: Address,
    value: U256,
    data: Vec<u8>,
    function: &'static str,
}

/// Builds, signs, and broadcasts swap transactions.
pub struct SwapExecutor {
    sequencer: Arc<NonceSequencer>,
    confirm_timeout: Duration,
    poll_interval: Duration,
}

impl SwapExecutor {
    pub fn new(sequencer: Arc<NonceSequencer>) -> Self {
        Self {
            sequencer,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            poll_interval: RECEIPT_POLL_INTERVAL,
        }
    }

    /// Shorten confirmation waits (tests).
    pub fn with_confirm_timeout(mut self, timeout: Duration, poll: Duration) -> Self {
        self.confirm_timeout = timeout;
        self.poll_interval = poll;
        self
    }

    /// Authorize `spender` to move `amount` of `token`. Blocks until the
    /// approval is mined: an unconfirmed approval makes the following
    /// swap revert and waste its gas.
    pub async fn approve<R: EthRpc>(
        &self,
        rpc: &R,
        chain: &ChainConfig,
        signer: &PrivateKeySigner,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> Result<B256> {
        let data = IERC20::approveCall {
            spender,
            value: amount,
        }
        .abi_encode();

        let hash = self
            .submit(
                rpc,
                chain,
                signer,
                TxRequest {
                    to: token,
                    value: U256::ZERO,
                    data,
                    function: "approve",
                },
            )
            .await?;

        info!(chain = %chain.name, token = %token, hash = %hash, "Approval broadcast, awaiting receipt");

        match self.wait_for_confirmation(rpc, hash).await? {
            TxStatus::Success => Ok(hash),
            TxStatus::Reverted => Err(EngineError::ApprovalFailed { token, hash }),
            TxStatus::Pending => {
                warn!(hash = %hash, "Approval unconfirmed within timeout");
                Err(EngineError::ApprovalFailed { token, hash })
            }
        }
    }

    /// Spend `amount_in` wei of the native asset for `token`, path
    /// [wrapped-native, token]. Fire-and-forget: returns the transaction
    /// hash; call [`confirm`](Self::confirm) to resolve the outcome.
    pub async fn swap_native_for_token<R: EthRpc>(
        &self,
        rpc: &R,
        chain: &ChainConfig,
        signer: &PrivateKeySigner,
        token: Address,
        amount_in: U256,
        minimum_out: U256,
    ) -> Result<B256> {
        let data = IUniswapV2Router::swapExactETHForTokensCall {
            amountOutMin: minimum_out,
            path: vec![chain.wrapped_native, token],
            to: signer.address(),
            deadline: swap_deadline(),
        }
        .abi_encode();

        self.submit(
            rpc,
            chain,
            signer,
            TxRequest {
                to: chain.router,
                value: amount_in,
                data,
                function: "swapExactETHForTokens",
            },
        )
        .await
    }

    /// Sell `amount_in` token units for the native asset, path
    /// [token, wrapped-native]. Requires a prior successful
    /// [`approve`](Self::approve) for the router.
    ///
    /// `minimum_out = None` disables the slippage bound entirely; that
    /// is a caller's explicit choice and is logged as such.
    pub async fn swap_token_for_native<R: EthRpc>(
        &self,
        rpc: &R,
        chain: &ChainConfig,
        signer: &PrivateKeySigner,
        token: Address,
        amount_in: U256,
        minimum_out: Option<U256>,
    ) -> Result<B256> {
        let minimum_out = match minimum_out {
            Some(min) => min,
            None => {
                warn!(
                    chain = %chain.name,
                    token = %token,
                    "Selling with zero minimum output: slippage is unbounded"
                );
                U256::ZERO
            }
        };

        let data = IUniswapV2Router::swapExactTokensForETHCall {
            amountIn: amount_in,
            amountOutMin: minimum_out,
            path: vec![token, chain.wrapped_native],
            to: signer.address(),
            deadline: swap_deadline(),
        }
        .abi_encode();

        self.submit(
            rpc,
            chain,
            signer,
            TxRequest {
                to: chain.router,
                value: U256::ZERO,
                data,
                function: "swapExactTokensForETH",
            },
        )
        .await
    }

    /// Idempotent single-shot confirmation query. A polling failure
    /// carries the hash: the transaction may well be mined, only the
    /// receipt read failed.
    pub async fn confirm<R: EthRpc>(&self, rpc: &R, hash: B256) -> Result<TxStatus> {
        let receipt = rpc
            .transaction_receipt(hash)
            .await
            .map_err(|e| EngineError::ConfirmationFailure {
                hash,
                message: e.to_string(),
            })?;

        Ok(match receipt {
            None => TxStatus::Pending,
            Some(r) if r.status => TxStatus::Success,
            Some(_) => TxStatus::Reverted,
        })
    }

    /// Poll for a receipt until the confirmation timeout elapses.
    pub async fn wait_for_confirmation<R: EthRpc>(&self, rpc: &R, hash: B256) -> Result<TxStatus> {
        let deadline = tokio::time::Instant::now() + self.confirm_timeout;

        loop {
            match self.confirm(rpc, hash).await? {
                TxStatus::Pending => {
                    if tokio::time::Instant::now() >= deadline {
                        return Ok(TxStatus::Pending);
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                resolved => return Ok(resolved),
            }
        }
    }

    /// The shared protocol: simulate, reserve, sign, broadcast.
    ///
    /// The nonce is reserved only after gas estimation succeeds, so a
    /// doomed transaction consumes no nonce. After broadcast the nonce
    /// is committed on success, released if the node rejected the
    /// payload outright, and burned when the outcome is unknown.
    async fn submit<R: EthRpc>(
        &self,
        rpc: &R,
        chain: &ChainConfig,
        signer: &PrivateKeySigner,
        req: TxRequest,
    ) -> Result<B256> {
        let from = signer.address();

        let gas_limit = rpc
            .estimate_gas(from, req.to, req.value, req.data.clone().into())
            .await
            .map_err(|e| match e {
                RpcError::Node { message, .. } => EngineError::SimulationReverted {
                    chain: chain.name.clone(),
                    account: from,
                    function: req.function,
                    reason: message,
                },
                other => EngineError::Rpc(other.to_string()),
            })?;

        let gas_price = rpc
            .gas_price()
            .await
            .map_err(|e| EngineError::Rpc(e.to_string()))?;

        let nonce = self.sequencer.reserve(rpc, &chain.name, from).await?;

        let mut tx = TxLegacy {
            chain_id: Some(chain.chain_id),
            nonce,
            gas_price: u128::try_from(gas_price).unwrap_or(u128::MAX),
            gas_limit,
            to: TxKind::Call(req.to),
            value: req.value,
            input: req.data.into(),
        };

        let signature = match signer.sign_transaction_sync(&mut tx) {
            Ok(sig) => sig,
            Err(e) => {
                self.sequencer.release(&chain.name, from, nonce).await?;
                return Err(EngineError::SigningFailure {
                    chain: chain.name.clone(),
                    function: req.function,
                    message: e.to_string(),
                });
            }
        };

        let envelope = TxEnvelope::Legacy(tx.into_signed(signature));
        let mut raw = Vec::with_capacity(envelope.encode_2718_len());
        envelope.encode_2718(&mut raw);

        let pending = PendingTransaction {
            chain: chain.name.clone(),
            account: from,
            nonce,
            raw: raw.clone(),
            submitted_at: Utc::now(),
        };
        debug!(
            chain = %pending.chain,
            account = %pending.account,
            nonce = pending.nonce,
            function = req.function,
            gas_limit = gas_limit,
            raw = %format!("0x{}", hex::encode(&pending.raw)),
            "Broadcasting transaction"
        );

        match rpc.send_raw_transaction(Bytes::from(raw)).await {
            Ok(hash) => {
                self.sequencer.commit(&chain.name, from, nonce).await?;
                info!(
                    chain = %chain.name,
                    function = req.function,
                    nonce = nonce,
                    hash = %hash,
                    "Transaction broadcast"
                );
                Ok(hash)
            }
            Err(RpcError::Timeout) => {
                // Outcome unknown. The transaction may have landed, so
                // the nonce must not be reused.
                self.sequencer.burn(&chain.name, from, nonce).await?;
                Err(EngineError::BroadcastOutcomeUnknown {
                    chain: chain.name.clone(),
                    account: from,
                    nonce,
                })
            }
            Err(e) => {
                self.sequencer.release(&chain.name, from, nonce).await?;
                Err(EngineError::BroadcastFailure {
                    chain: chain.name.clone(),
                    account: from,
                    function: req.function,
                    message: e.to_string(),
                })
            }
        }
    }
}

fn swap_deadline() -> U256 {
    U256::from(Utc::now().timestamp() as u64 + SWAP_DEADLINE_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::MockRpc;
    use alloy_eips::eip2718::Decodable2718;

    fn test_chain() -> ChainConfig {
        ChainConfig {
            name: "base".to_string(),
            chain_id: 8453,
            rpc_url: "http://localhost:8545".to_string(),
            router: Address::repeat_byte(0x11),
            factory: Address::repeat_byte(0x22),
            wrapped_native: Address::repeat_byte(0x33),
        }
    }

    fn test_signer() -> PrivateKeySigner {
        PrivateKeySigner::random()
    }

    fn executor() -> (Arc<NonceSequencer>, SwapExecutor) {
        let sequencer = Arc::new(NonceSequencer::new());
        let executor = SwapExecutor::new(Arc::clone(&sequencer))
            .with_confirm_timeout(Duration::from_millis(50), Duration::from_millis(10));
        (sequencer, executor)
    }

    fn decode_legacy(raw: &Bytes) -> TxLegacy {
        let envelope = TxEnvelope::decode_2718(&mut raw.as_ref()).unwrap();
        match envelope {
            TxEnvelope::Legacy(signed) => signed.tx().clone(),
            other => panic!("expected legacy transaction, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_buy_builds_expected_transaction() {
        let chain = test_chain();
        let signer = test_signer();
        let token = Address::repeat_byte(0xaa);
        let rpc = MockRpc::new();
        let (_, executor) = executor();

        let amount_in = U256::from(100_000_000_000_000_000u128); // 0.1 ETH
        let hash = executor
            .swap_native_for_token(&rpc, &chain, &signer, token, amount_in, U256::from(980u64))
            .await
            .unwrap();

        let sent = rpc.sent_transactions();
        assert_eq!(sent.len(), 1);
        assert_eq!(rpc.sent_hashes()[0], hash);

        let tx = decode_legacy(&sent[0]);
        assert_eq!(tx.chain_id, Some(8453));
        assert_eq!(tx.nonce, 0);
        assert_eq!(tx.to, TxKind::Call(chain.router));
        assert_eq!(tx.value, amount_in);

        let call =
            IUniswapV2Router::swapExactETHForTokensCall::abi_decode(&tx.input, true).unwrap();
        assert_eq!(call.amountOutMin, U256::from(980u64));
        assert_eq!(call.path, vec![chain.wrapped_native, token]);
        assert_eq!(call.to, signer.address());

        let now = Utc::now().timestamp() as u64;
        let deadline: u64 = call.deadline.to::<u64>();
        assert!(deadline >= now + SWAP_DEADLINE_SECS - 5);
        assert!(deadline <= now + SWAP_DEADLINE_SECS + 5);
    }

    #[tokio::test]
    async fn test_simulation_revert_consumes_no_nonce() {
        let chain = test_chain();
        let signer = test_signer();
        let rpc = MockRpc::new()
            .with_estimate_revert("TransferHelper: TRANSFER_FROM_FAILED")
            .with_transaction_count(signer.address(), 7);
        let (sequencer, executor) = executor();

        let err = executor
            .swap_native_for_token(
                &rpc,
                &chain,
                &signer,
                Address::repeat_byte(0xaa),
                U256::from(1u64),
                U256::ZERO,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::SimulationReverted { .. }));
        assert_eq!(rpc.estimate_calls(), 1);
        assert!(rpc.sent_transactions().is_empty());
        // no reservation happened: next reserve yields the seed
        assert_eq!(
            sequencer
                .reserve(&rpc, &chain.name, signer.address())
                .await
                .unwrap(),
            7
        );
    }

    #[tokio::test]
    async fn test_rejected_broadcast_releases_nonce() {
        let chain = test_chain();
        let signer = test_signer();
        let rpc = MockRpc::new().with_send_rejection();
        let (sequencer, executor) = executor();

        let err = executor
            .swap_native_for_token(
                &rpc,
                &chain,
                &signer,
                Address::repeat_byte(0xaa),
                U256::from(1u64),
                U256::ZERO,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::BroadcastFailure { .. }));
        // the released nonce is reissued, not skipped
        assert_eq!(
            sequencer
                .reserve(&rpc, &chain.name, signer.address())
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_timed_out_broadcast_burns_nonce() {
        let chain = test_chain();
        let signer = test_signer();
        let rpc = MockRpc::new().with_send_timeout();
        let (sequencer, executor) = executor();

        let err = executor
            .swap_native_for_token(
                &rpc,
                &chain,
                &signer,
                Address::repeat_byte(0xaa),
                U256::from(1u64),
                U256::ZERO,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::BroadcastOutcomeUnknown { nonce: 0, .. }
        ));
        // burned, never reused
        assert_eq!(
            sequencer
                .reserve(&rpc, &chain.name, signer.address())
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_concurrent_buys_use_distinct_nonces() {
        let chain = test_chain();
        let signer = test_signer();
        let rpc = MockRpc::new();
        let sequencer = Arc::new(NonceSequencer::new());
        let executor = Arc::new(SwapExecutor::new(Arc::clone(&sequencer)));

        let mut handles = Vec::new();
        for i in 0..2 {
            let executor = Arc::clone(&executor);
            let rpc = rpc.clone();
            let chain = chain.clone();
            let signer = signer.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .swap_native_for_token(
                        &rpc,
                        &chain,
                        &signer,
                        Address::repeat_byte(0xaa),
                        U256::from(100u64 + i),
                        U256::ZERO,
                    )
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let sent = rpc.sent_transactions();
        assert_eq!(sent.len(), 2);
        let mut nonces: Vec<u64> = sent.iter().map(|raw| decode_legacy(raw).nonce).collect();
        nonces.sort_unstable();
        assert_eq!(nonces, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_approve_waits_for_successful_receipt() {
        let chain = test_chain();
        let signer = test_signer();
        let token = Address::repeat_byte(0xaa);
        let (_, executor) = executor();

        let rpc = MockRpc::new().auto_mine(true);
        let hash = executor
            .approve(&rpc, &chain, &signer, token, chain.router, U256::MAX)
            .await
            .unwrap();
        assert_eq!(rpc.sent_hashes()[0], hash);

        let rpc = MockRpc::new().auto_mine(false);
        let err = executor
            .approve(&rpc, &chain, &signer, token, chain.router, U256::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ApprovalFailed { .. }));
    }

    #[tokio::test]
    async fn test_sell_without_minimum_sets_zero_bound() {
        let chain = test_chain();
        let signer = test_signer();
        let token = Address::repeat_byte(0xaa);
        let rpc = MockRpc::new();
        let (_, executor) = executor();

        executor
            .swap_token_for_native(&rpc, &chain, &signer, token, U256::from(5000u64), None)
            .await
            .unwrap();

        let tx = decode_legacy(&rpc.sent_transactions()[0]);
        assert_eq!(tx.value, U256::ZERO);
        let call =
            IUniswapV2Router::swapExactTokensForETHCall::abi_decode(&tx.input, true).unwrap();
        assert_eq!(call.amountOutMin, U256::ZERO);
        assert_eq!(call.path, vec![token, chain.wrapped_native]);
    }

    #[tokio::test]
    async fn test_confirm_is_idempotent() {
        let chain = test_chain();
        let signer = test_signer();
        let rpc = MockRpc::new().auto_mine(true);
        let (_, executor) = executor();

        let hash = executor
            .swap_native_for_token(
                &rpc,
                &chain,
                &signer,
                Address::repeat_byte(0xaa),
                U256::from(1u64),
                U256::ZERO,
            )
            .await
            .unwrap();

        assert_eq!(executor.confirm(&rpc, hash).await.unwrap(), TxStatus::Success);
        assert_eq!(executor.confirm(&rpc, hash).await.unwrap(), TxStatus::Success);
        // unknown hash stays pending
        assert_eq!(
            executor.confirm(&rpc, B256::repeat_byte(0xff)).await.unwrap(),
            TxStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_confirm_failure_carries_hash() {
        let rpc = MockRpc::new().with_receipt_failure();
        let (_, executor) = executor();

        let wanted = B256::repeat_byte(0x07);
        let err = executor.confirm(&rpc, wanted).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::ConfirmationFailure { hash, .. } if hash == wanted
        ));
    }

    #[test]
    fn test_parse_signer_accepts_0x_prefix() {
        let key = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
        let a = parse_signer(key).unwrap();
        let b = parse_signer(&format!("0x{key}")).unwrap();
        assert_eq!(a.address(), b.address());

        assert!(matches!(
            parse_signer("not-a-key"),
            Err(EngineError::KeyParseFailure(_))
        ));
    }
}
