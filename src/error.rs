//! Error taxonomy for the trade execution engine.
//!
//! Every failure carries enough context (chain, account, attempted
//! function) for an operator to decide between "retry safely" and
//! "investigate before retrying", and maps to the pipeline stage that
//! produced it.

use alloy_primitives::{Address, B256};
use thiserror::Error;

/// Pipeline stage that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Quote,
    Nonce,
    Simulate,
    Sign,
    Broadcast,
    Confirm,
    Ledger,
    Config,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Quote => "quote",
            Stage::Nonce => "nonce",
            Stage::Simulate => "simulate",
            Stage::Sign => "sign",
            Stage::Broadcast => "broadcast",
            Stage::Confirm => "confirm",
            Stage::Ledger => "ledger",
            Stage::Config => "config",
        }
    }
}

/// Main error type for the trade execution engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("unsupported chain: {0}")]
    UnsupportedChain(String),

    #[error("chain already registered: {0}")]
    ChainAlreadyRegistered(String),

    #[error("chain {name}: configured chain id {configured} but node reports {reported}")]
    ChainIdMismatch {
        name: String,
        configured: u64,
        reported: u64,
    },

    #[error("unknown signing account: {0}")]
    UnknownAccount(String),

    #[error("failed to parse signing key: {0}")]
    KeyParseFailure(String),

    #[error("invalid address in configuration: {0}")]
    InvalidAddress(String),

    #[error("ABI encoding failed for {function}: {message}")]
    AbiEncodingFailure {
        function: &'static str,
        message: String,
    },

    #[error("invalid slippage {0}%: must be in [0, 100)")]
    InvalidSlippage(rust_decimal::Decimal),

    #[error("insufficient liquidity for path {token_in} -> {token_out} on {chain}")]
    InsufficientLiquidity {
        chain: String,
        token_in: Address,
        token_out: Address,
    },

    #[error("simulation reverted on {chain} for {function} from {account}: {reason}")]
    SimulationReverted {
        chain: String,
        account: Address,
        function: &'static str,
        reason: String,
    },

    #[error("nonce conflict on {chain} for {account}: {message}")]
    NonceConflict {
        chain: String,
        account: Address,
        message: String,
    },

    #[error("failed to seed nonce on {chain} for {account}: {message}")]
    NonceSeedFailure {
        chain: String,
        account: Address,
        message: String,
    },

    #[error("signing failed on {chain} for {function}: {message}")]
    SigningFailure {
        chain: String,
        function: &'static str,
        message: String,
    },

    #[error("broadcast failed on {chain} for {function} from {account}: {message}")]
    BroadcastFailure {
        chain: String,
        account: Address,
        function: &'static str,
        message: String,
    },

    /// Broadcast was attempted but the node never answered. The nonce
    /// used is burned rather than reused (see `NonceSequencer`).
    #[error("broadcast outcome unknown on {chain} for {account}, nonce {nonce} burned")]
    BroadcastOutcomeUnknown {
        chain: String,
        account: Address,
        nonce: u64,
    },

    #[error("approval transaction {hash} for token {token} failed on-chain")]
    ApprovalFailed { token: Address, hash: B256 },

    #[error("swap transaction {hash} reverted on-chain")]
    SwapReverted { hash: B256 },

    /// Receipt polling failed, not the transaction itself. The hash is
    /// carried so the operator can reconcile with a later `confirm`.
    #[error("confirmation polling failed for {hash}: {message}")]
    ConfirmationFailure { hash: B256, message: String },

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("duplicate transaction hash in ledger: {0}")]
    DuplicateHash(String),

    #[error("duplicate open position for contract: {0}")]
    DuplicateContract(String),

    #[error("no open position for contract: {0}")]
    NoOpenPosition(String),

    #[error("ledger record not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl EngineError {
    /// The pipeline stage this error belongs to, for operator-facing
    /// reporting.
    pub fn stage(&self) -> Stage {
        match self {
            EngineError::UnsupportedChain(_)
            | EngineError::ChainAlreadyRegistered(_)
            | EngineError::ChainIdMismatch { .. }
            | EngineError::UnknownAccount(_)
            | EngineError::KeyParseFailure(_)
            | EngineError::InvalidAddress(_)
            | EngineError::InvalidSlippage(_) => Stage::Config,
            EngineError::InsufficientLiquidity { .. } => Stage::Quote,
            EngineError::NonceConflict { .. } | EngineError::NonceSeedFailure { .. } => {
                Stage::Nonce
            }
            EngineError::AbiEncodingFailure { .. } | EngineError::SigningFailure { .. } => {
                Stage::Sign
            }
            EngineError::SimulationReverted { .. } => Stage::Simulate,
            EngineError::BroadcastFailure { .. }
            | EngineError::BroadcastOutcomeUnknown { .. }
            | EngineError::Rpc(_) => Stage::Broadcast,
            EngineError::ApprovalFailed { .. }
            | EngineError::SwapReverted { .. }
            | EngineError::ConfirmationFailure { .. } => Stage::Confirm,
            EngineError::DuplicateHash(_)
            | EngineError::DuplicateContract(_)
            | EngineError::NoOpenPosition(_)
            | EngineError::NotFound(_)
            | EngineError::Database(_) => Stage::Ledger,
        }
    }

    /// Whether an operator may retry the triggering signal without
    /// reconciling on-chain state first. Broadcast-adjacent failures are
    /// never safe to blind-retry.
    pub fn retry_safe(&self) -> bool {
        !matches!(
            self,
            EngineError::BroadcastFailure { .. }
                | EngineError::BroadcastOutcomeUnknown { .. }
                | EngineError::ApprovalFailed { .. }
                | EngineError::SwapReverted { .. }
                | EngineError::ConfirmationFailure { .. }
        )
    }
}

/// Result type alias using the engine error.
pub type Result<T> = std::result::Result<T, EngineError>;
