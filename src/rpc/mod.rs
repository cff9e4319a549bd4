//! Minimal Ethereum JSON-RPC capability interface and its HTTP adapter.
//!
//! The engine depends on exactly six node capabilities: `eth_call`,
//! `eth_estimateGas`, `eth_getTransactionCount`, `eth_gasPrice`,
//! `eth_sendRawTransaction`, `eth_getTransactionReceipt`, plus
//! `eth_chainId` for warm-up verification. Anything that can answer
//! those is a valid transport; executor, quote and nonce code is generic
//! over [`EthRpc`], never over a concrete client.
//!
//! Read-only calls are retried with bounded exponential backoff on
//! transport failures. `eth_sendRawTransaction` is never auto-retried:
//! a retry after an unknown outcome risks double execution.

#[cfg(test)]
pub mod mock;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// Transport-level errors, split into transient (retryable for reads)
/// and terminal classes.
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("node error {code}: {message}")]
    Node { code: i64, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl RpcError {
    /// Transient errors may be retried for read-only calls.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Transport(_) | RpcError::Timeout)
    }
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Mined-transaction receipt, reduced to what the engine needs.
#[derive(Debug, Clone)]
pub struct TxReceipt {
    pub transaction_hash: B256,
    pub status: bool,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
}

/// The capability interface every chain transport must satisfy.
pub trait EthRpc: Send + Sync {
    /// `eth_chainId`
    fn chain_id(&self) -> impl Future<Output = RpcResult<u64>> + Send;

    /// `eth_call` against latest state
    fn call(
        &self,
        to: Address,
        value: U256,
        data: Bytes,
    ) -> impl Future<Output = RpcResult<Bytes>> + Send;

    /// `eth_estimateGas`; a node rejection here means the call would
    /// revert on-chain
    fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        value: U256,
        data: Bytes,
    ) -> impl Future<Output = RpcResult<u64>> + Send;

    /// `eth_gasPrice`, fetched fresh per transaction
    fn gas_price(&self) -> impl Future<Output = RpcResult<U256>> + Send;

    /// `eth_getTransactionCount` with the "pending" tag; nonce seed
    fn transaction_count(&self, account: Address) -> impl Future<Output = RpcResult<u64>> + Send;

    /// `eth_sendRawTransaction`; never retried by the transport
    fn send_raw_transaction(&self, raw: Bytes) -> impl Future<Output = RpcResult<B256>> + Send;

    /// `eth_getTransactionReceipt`; None while the transaction is
    /// pending or unknown
    fn transaction_receipt(
        &self,
        hash: B256,
    ) -> impl Future<Output = RpcResult<Option<TxReceipt>>> + Send;
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const READ_RETRY_WINDOW: Duration = Duration::from_secs(8);

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// HTTP JSON-RPC adapter over reqwest.
pub struct HttpRpc {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl HttpRpc {
    pub fn new(url: impl Into<String>) -> RpcResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    /// One JSON-RPC round trip, no retry.
    async fn request(&self, method: &str, params: Value) -> RpcResult<Value> {
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        debug!(method = method, url = %self.url, "RPC request");

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcError::Timeout
                } else {
                    RpcError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(RpcError::Transport(format!(
                "HTTP {} from {}",
                response.status(),
                self.url
            )));
        }

        let parsed: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| RpcError::Malformed(e.to_string()))?;

        if let Some(err) = parsed.error {
            return Err(RpcError::Node {
                code: err.code,
                message: err.message,
            });
        }

        parsed
            .result
            .ok_or_else(|| RpcError::Malformed("response carried neither result nor error".into()))
    }

    /// Bounded-retry wrapper for read-only methods. Node errors are
    /// permanent (a revert will not stop reverting); only transport
    /// failures are retried.
    async fn request_read(&self, method: &str, params: Value) -> RpcResult<Value> {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(READ_RETRY_WINDOW),
            ..ExponentialBackoff::default()
        };

        backoff::future::retry(policy, || async {
            self.request(method, params.clone()).await.map_err(|e| {
                if e.is_transient() {
                    warn!(method = method, error = %e, "Transient RPC failure, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }

    /// Native-asset balance, for operator display.
    pub async fn balance(&self, account: Address) -> RpcResult<U256> {
        let result = self
            .request_read("eth_getBalance", json!([account, "latest"]))
            .await?;
        parse_u256(&result)
    }
}

impl EthRpc for HttpRpc {
    async fn chain_id(&self) -> RpcResult<u64> {
        let result = self.request_read("eth_chainId", json!([])).await?;
        parse_quantity(&result)
    }

    async fn call(&self, to: Address, value: U256, data: Bytes) -> RpcResult<Bytes> {
        let result = self
            .request_read(
                "eth_call",
                json!([{"to": to, "value": value, "data": data}, "latest"]),
            )
            .await?;
        parse_bytes(&result)
    }

    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        value: U256,
        data: Bytes,
    ) -> RpcResult<u64> {
        let result = self
            .request_read(
                "eth_estimateGas",
                json!([{"from": from, "to": to, "value": value, "data": data}]),
            )
            .await?;
        parse_quantity(&result)
    }

    async fn gas_price(&self) -> RpcResult<U256> {
        let result = self.request_read("eth_gasPrice", json!([])).await?;
        parse_u256(&result)
    }

    async fn transaction_count(&self, account: Address) -> RpcResult<u64> {
        let result = self
            .request_read("eth_getTransactionCount", json!([account, "pending"]))
            .await?;
        parse_quantity(&result)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> RpcResult<B256> {
        // Single attempt on purpose: the caller decides what an unknown
        // outcome means for the nonce.
        let result = self.request("eth_sendRawTransaction", json!([raw])).await?;
        parse_b256(&result)
    }

    async fn transaction_receipt(&self, hash: B256) -> RpcResult<Option<TxReceipt>> {
        let result = self
            .request_read("eth_getTransactionReceipt", json!([hash]))
            .await?;

        if result.is_null() {
            return Ok(None);
        }

        let status = result
            .get("status")
            .and_then(Value::as_str)
            .map(|s| s == "0x1")
            .ok_or_else(|| RpcError::Malformed("receipt missing status".into()))?;
        let block_number = result
            .get("blockNumber")
            .filter(|v| !v.is_null())
            .map(parse_quantity)
            .transpose()?;
        let gas_used = result
            .get("gasUsed")
            .filter(|v| !v.is_null())
            .map(parse_quantity)
            .transpose()?;

        Ok(Some(TxReceipt {
            transaction_hash: hash,
            status,
            block_number,
            gas_used,
        }))
    }
}

fn hex_str(value: &Value) -> RpcResult<&str> {
    value
        .as_str()
        .ok_or_else(|| RpcError::Malformed(format!("expected hex string, got {value}")))
}

fn parse_quantity(value: &Value) -> RpcResult<u64> {
    let s = hex_str(value)?;
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| RpcError::Malformed(format!("bad quantity: {e}")))
}

fn parse_u256(value: &Value) -> RpcResult<U256> {
    let s = hex_str(value)?;
    s.parse()
        .map_err(|e| RpcError::Malformed(format!("bad uint256: {e}")))
}

fn parse_b256(value: &Value) -> RpcResult<B256> {
    let s = hex_str(value)?;
    s.parse()
        .map_err(|e| RpcError::Malformed(format!("bad hash: {e}")))
}

fn parse_bytes(value: &Value) -> RpcResult<Bytes> {
    let s = hex_str(value)?;
    s.parse()
        .map_err(|e| RpcError::Malformed(format!("bad byte string: {e}")))
}
