//! In-memory [`EthRpc`] implementation for tests.
//!
//! Canned responses plus failure injection for the paths that matter:
//! simulation reverts, broadcast failures, and broadcast timeouts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};

use super::{EthRpc, RpcError, RpcResult, TxReceipt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendMode {
    Accept,
    Reject,
    Timeout,
}

#[derive(Debug)]
struct State {
    chain_id: u64,
    gas_price: U256,
    gas_estimate: u64,
    estimate_revert: Option<String>,
    nonces: HashMap<Address, u64>,
    // keyed by (target, 4-byte selector)
    call_responses: HashMap<(Address, [u8; 4]), Bytes>,
    call_reverts: HashMap<(Address, [u8; 4]), String>,
    send_mode: SendMode,
    sent: Vec<Bytes>,
    sent_hashes: Vec<B256>,
    receipts: HashMap<B256, TxReceipt>,
    // when set, every accepted broadcast gets an immediate receipt
    auto_receipt_status: Option<bool>,
    receipt_failure: bool,
    estimate_calls: usize,
}

/// Shared-state mock; clones observe the same transcript, so a test can
/// hand one clone to the code under test and keep another for asserts.
#[derive(Clone)]
pub struct MockRpc {
    state: Arc<Mutex<State>>,
}

impl MockRpc {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                chain_id: 8453,
                gas_price: U256::from(1_000_000_000u64),
                gas_estimate: 180_000,
                estimate_revert: None,
                nonces: HashMap::new(),
                call_responses: HashMap::new(),
                call_reverts: HashMap::new(),
                send_mode: SendMode::Accept,
                sent: Vec::new(),
                sent_hashes: Vec::new(),
                receipts: HashMap::new(),
                auto_receipt_status: None,
                receipt_failure: false,
                estimate_calls: 0,
            })),
        }
    }

    pub fn with_chain_id(self, chain_id: u64) -> Self {
        self.state.lock().unwrap().chain_id = chain_id;
        self
    }

    pub fn with_gas_price(self, gas_price: U256) -> Self {
        self.state.lock().unwrap().gas_price = gas_price;
        self
    }

    pub fn with_transaction_count(self, account: Address, count: u64) -> Self {
        self.state.lock().unwrap().nonces.insert(account, count);
        self
    }

    /// Canned `eth_call` return data for a (target, selector) pair.
    pub fn with_call_response(self, to: Address, selector: [u8; 4], data: Bytes) -> Self {
        self.state
            .lock()
            .unwrap()
            .call_responses
            .insert((to, selector), data);
        self
    }

    pub fn with_call_revert(self, to: Address, selector: [u8; 4], reason: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .call_reverts
            .insert((to, selector), reason.to_string());
        self
    }

    pub fn with_estimate_revert(self, reason: &str) -> Self {
        self.state.lock().unwrap().estimate_revert = Some(reason.to_string());
        self
    }

    pub fn with_send_rejection(self) -> Self {
        self.state.lock().unwrap().send_mode = SendMode::Reject;
        self
    }

    pub fn with_send_timeout(self) -> Self {
        self.state.lock().unwrap().send_mode = SendMode::Timeout;
        self
    }

    /// Every accepted broadcast is immediately "mined" with the given
    /// receipt status.
    pub fn auto_mine(self, success: bool) -> Self {
        self.state.lock().unwrap().auto_receipt_status = Some(success);
        self
    }

    /// Every receipt poll fails at the transport level.
    pub fn with_receipt_failure(self) -> Self {
        self.state.lock().unwrap().receipt_failure = true;
        self
    }

    pub fn sent_transactions(&self) -> Vec<Bytes> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn sent_hashes(&self) -> Vec<B256> {
        self.state.lock().unwrap().sent_hashes.clone()
    }

    pub fn estimate_calls(&self) -> usize {
        self.state.lock().unwrap().estimate_calls
    }
}

impl Default for MockRpc {
    fn default() -> Self {
        Self::new()
    }
}

fn selector_of(data: &[u8]) -> [u8; 4] {
    let mut sel = [0u8; 4];
    if data.len() >= 4 {
        sel.copy_from_slice(&data[..4]);
    }
    sel
}

impl EthRpc for MockRpc {
    async fn chain_id(&self) -> RpcResult<u64> {
        Ok(self.state.lock().unwrap().chain_id)
    }

    async fn call(&self, to: Address, _value: U256, data: Bytes) -> RpcResult<Bytes> {
        let state = self.state.lock().unwrap();
        let key = (to, selector_of(&data));
        if let Some(reason) = state.call_reverts.get(&key) {
            return Err(RpcError::Node {
                code: 3,
                message: format!("execution reverted: {reason}"),
            });
        }
        state.call_responses.get(&key).cloned().ok_or(RpcError::Node {
            code: -32000,
            message: "execution reverted".to_string(),
        })
    }

    async fn estimate_gas(
        &self,
        _from: Address,
        _to: Address,
        _value: U256,
        _data: Bytes,
    ) -> RpcResult<u64> {
        let mut state = self.state.lock().unwrap();
        state.estimate_calls += 1;
        if let Some(reason) = &state.estimate_revert {
            return Err(RpcError::Node {
                code: 3,
                message: format!("execution reverted: {reason}"),
            });
        }
        Ok(state.gas_estimate)
    }

    async fn gas_price(&self) -> RpcResult<U256> {
        Ok(self.state.lock().unwrap().gas_price)
    }

    async fn transaction_count(&self, account: Address) -> RpcResult<u64> {
        Ok(*self.state.lock().unwrap().nonces.get(&account).unwrap_or(&0))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> RpcResult<B256> {
        let mut state = self.state.lock().unwrap();
        match state.send_mode {
            SendMode::Reject => {
                return Err(RpcError::Node {
                    code: -32000,
                    message: "nonce too low".to_string(),
                })
            }
            SendMode::Timeout => return Err(RpcError::Timeout),
            SendMode::Accept => {}
        }

        let hash = keccak256(&raw);
        state.sent.push(raw);
        state.sent_hashes.push(hash);
        if let Some(status) = state.auto_receipt_status {
            state.receipts.insert(
                hash,
                TxReceipt {
                    transaction_hash: hash,
                    status,
                    block_number: Some(1),
                    gas_used: Some(21_000),
                },
            );
        }
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: B256) -> RpcResult<Option<TxReceipt>> {
        let state = self.state.lock().unwrap();
        if state.receipt_failure {
            return Err(RpcError::Transport("connection reset by peer".to_string()));
        }
        Ok(state.receipts.get(&hash).cloned())
    }
}
