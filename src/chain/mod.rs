//! Chain registry: per-chain connection parameters.
//!
//! Populated once at startup, read-only afterwards. The chain id
//! registered here is the one used for EIP-155 signing, so it must match
//! what the RPC endpoint reports; `verify` checks that at warm-up.

use std::collections::HashMap;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, Result};
use crate::rpc::EthRpc;

/// Static parameters for one supported chain. Immutable after
/// registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Lookup name, e.g. "base"
    pub name: String,

    /// EIP-155 chain id used when signing
    pub chain_id: u64,

    /// JSON-RPC endpoint
    pub rpc_url: String,

    /// UniswapV2-compatible router address
    pub router: Address,

    /// Pair factory address
    pub factory: Address,

    /// Wrapped native asset (e.g. WETH) used inside swap paths
    pub wrapped_native: Address,
}

/// Lookup table of supported chains. No locking: built before the engine
/// starts and shared immutably.
#[derive(Debug, Default)]
pub struct ChainRegistry {
    chains: HashMap<String, ChainConfig>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chain. Fails if the name is already taken; a silent
    /// overwrite would let two configs disagree on the signing chain id.
    pub fn register(&mut self, config: ChainConfig) -> Result<()> {
        if self.chains.contains_key(&config.name) {
            return Err(EngineError::ChainAlreadyRegistered(config.name));
        }
        info!(chain = %config.name, chain_id = config.chain_id, "Registered chain");
        self.chains.insert(config.name.clone(), config);
        Ok(())
    }

    /// Resolve a chain by name. An unknown name is misconfiguration and
    /// terminal for the triggering signal, never retried.
    pub fn resolve(&self, name: &str) -> Result<&ChainConfig> {
        self.chains
            .get(name)
            .ok_or_else(|| EngineError::UnsupportedChain(name.to_string()))
    }

    /// Registered chain names, sorted for stable display.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.chains.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Warm-up check: the node behind each RPC endpoint must report the
    /// registered chain id, otherwise every signed transaction would be
    /// invalid on-chain.
    pub async fn verify<R: EthRpc>(&self, name: &str, rpc: &R) -> Result<()> {
        let config = self.resolve(name)?;
        let reported = rpc
            .chain_id()
            .await
            .map_err(|e| EngineError::Rpc(e.to_string()))?;
        if reported != config.chain_id {
            return Err(EngineError::ChainIdMismatch {
                name: config.name.clone(),
                configured: config.chain_id,
                reported,
            });
        }
        info!(chain = %config.name, chain_id = reported, "Chain id verified against node");
        Ok(())
    }
}

/// Built-in Base mainnet entry, with the RPC endpoint and contract
/// addresses overridable from the environment (BASE_RPC,
/// UNISWAP_BASE_ROUTER, UNISWAP_BASE_FACTORY, WETH_BASE_ADDRESS).
/// A present-but-malformed override is rejected, never silently
/// replaced by the builtin default: a typoed router means trading
/// against the wrong contract.
pub fn base_from_env() -> Result<ChainConfig> {
    fn addr_env(key: &str, default: &str) -> Result<Address> {
        match std::env::var(key) {
            Ok(value) => value
                .parse()
                .map_err(|_| EngineError::InvalidAddress(format!("{key}={value}"))),
            Err(_) => Ok(default.parse().expect("valid builtin address")),
        }
    }

    Ok(ChainConfig {
        name: "base".to_string(),
        chain_id: 8453,
        rpc_url: std::env::var("BASE_RPC").unwrap_or_else(|_| "https://mainnet.base.org".to_string()),
        router: addr_env(
            "UNISWAP_BASE_ROUTER",
            "0x4752ba5DBc23f44D87826276BF6Fd6b1C372aD24",
        )?,
        factory: addr_env(
            "UNISWAP_BASE_FACTORY",
            "0x8909Dc15e40173Ff4699343b6eB8132c65e18eC6",
        )?,
        wrapped_native: addr_env("WETH_BASE_ADDRESS", "0x4200000000000000000000000000000000000006")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    fn test_config(name: &str) -> ChainConfig {
        ChainConfig {
            name: name.to_string(),
            chain_id: 8453,
            rpc_url: "http://localhost:8545".to_string(),
            router: Address::repeat_byte(0x11),
            factory: Address::repeat_byte(0x22),
            wrapped_native: Address::repeat_byte(0x33),
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = ChainRegistry::new();
        registry.register(test_config("base")).unwrap();

        let config = registry.resolve("base").unwrap();
        assert_eq!(config.chain_id, 8453);

        let err = registry.resolve("solana").unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedChain(name) if name == "solana"));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ChainRegistry::new();
        registry.register(test_config("base")).unwrap();

        let err = registry.register(test_config("base")).unwrap_err();
        assert!(matches!(err, EngineError::ChainAlreadyRegistered(_)));
    }

    #[test]
    fn test_base_from_env_rejects_malformed_override() {
        // both checks in one test: the env var is process-global
        std::env::remove_var("UNISWAP_BASE_ROUTER");
        let config = base_from_env().unwrap();
        assert_eq!(config.chain_id, 8453);

        std::env::set_var("UNISWAP_BASE_ROUTER", "not-an-address");
        let err = base_from_env().unwrap_err();
        std::env::remove_var("UNISWAP_BASE_ROUTER");
        assert!(matches!(err, EngineError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_verify_chain_id_mismatch() {
        let mut registry = ChainRegistry::new();
        registry.register(test_config("base")).unwrap();

        let rpc = crate::rpc::mock::MockRpc::new().with_chain_id(1);
        let err = registry.verify("base", &rpc).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::ChainIdMismatch {
                configured: 8453,
                reported: 1,
                ..
            }
        ));

        let rpc = crate::rpc::mock::MockRpc::new().with_chain_id(8453);
        registry.verify("base", &rpc).await.unwrap();
    }
}
