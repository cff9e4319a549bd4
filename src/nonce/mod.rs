//! Per-(chain, account) transaction-nonce issuance.
//!
//! This is the one piece of shared mutable state in the engine. All
//! reservations go through a single mutex so that concurrent trade
//! signals against the same signing account can never be handed the
//! same nonce: two broadcasts with a colliding nonce get one of them
//! silently dropped at best.
//!
//! State machine per (chain, account):
//! `Uninitialized -> Seeded` (first reserve fetches the account's
//! pending transaction count) `-> Reserved(n) -> { Committed | Released }`.
//!
//! A released nonce is reissued before any fresh one. A nonce whose
//! broadcast outcome is unknown must be *burned* (committed without a
//! known transaction), never released: reuse risks a duplicate
//! submission of a trade that already landed.

use std::collections::{BTreeSet, HashMap};

use alloy_primitives::Address;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::rpc::EthRpc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NonceKey {
    chain: String,
    account: Address,
}

#[derive(Debug, Default)]
struct AccountState {
    /// Next fresh nonce to hand out
    next: u64,
    /// Currently reserved, not yet committed or released
    reserved: BTreeSet<u64>,
    /// Released for reuse; drained lowest-first before `next` advances
    released: BTreeSet<u64>,
}

/// Serialized nonce issuance for every signing account the engine uses.
#[derive(Debug, Default)]
pub struct NonceSequencer {
    accounts: Mutex<HashMap<NonceKey, AccountState>>,
}

impl NonceSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next nonce for (chain, account), seeding from the
    /// chain's pending transaction count on first use.
    ///
    /// The account lock is held across the seed fetch on purpose: a
    /// second signal arriving mid-seed must queue here, not race to its
    /// own seed.
    pub async fn reserve<R: EthRpc>(
        &self,
        rpc: &R,
        chain: &str,
        account: Address,
    ) -> Result<u64> {
        let key = NonceKey {
            chain: chain.to_string(),
            account,
        };

        let mut accounts = self.accounts.lock().await;

        if !accounts.contains_key(&key) {
            let seed = rpc.transaction_count(account).await.map_err(|e| {
                EngineError::NonceSeedFailure {
                    chain: chain.to_string(),
                    account,
                    message: e.to_string(),
                }
            })?;
            info!(chain = chain, account = %account, seed = seed, "Seeded nonce counter");
            accounts.insert(
                key.clone(),
                AccountState {
                    next: seed,
                    ..AccountState::default()
                },
            );
        }

        let state = accounts.get_mut(&key).expect("seeded above");

        let nonce = match state.released.iter().next().copied() {
            Some(reused) => {
                state.released.remove(&reused);
                reused
            }
            None => {
                let fresh = state.next;
                state.next += 1;
                fresh
            }
        };

        state.reserved.insert(nonce);
        debug!(chain = chain, account = %account, nonce = nonce, "Reserved nonce");
        Ok(nonce)
    }

    /// Return a reserved nonce for reuse. Only legal while the
    /// transaction using it was never broadcast.
    pub async fn release(&self, chain: &str, account: Address, nonce: u64) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        let state = Self::state_for(&mut accounts, chain, account, nonce)?;

        if !state.reserved.remove(&nonce) {
            return Err(EngineError::NonceConflict {
                chain: chain.to_string(),
                account,
                message: format!("release of nonce {nonce} that is not reserved"),
            });
        }

        state.released.insert(nonce);
        debug!(chain = chain, account = %account, nonce = nonce, "Released nonce");
        Ok(())
    }

    /// Mark a reserved nonce as consumed by a broadcast transaction.
    pub async fn commit(&self, chain: &str, account: Address, nonce: u64) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        let state = Self::state_for(&mut accounts, chain, account, nonce)?;

        if !state.reserved.remove(&nonce) {
            return Err(EngineError::NonceConflict {
                chain: chain.to_string(),
                account,
                message: format!("commit of nonce {nonce} that is not reserved"),
            });
        }

        debug!(chain = chain, account = %account, nonce = nonce, "Committed nonce");
        Ok(())
    }

    /// Speculatively commit a nonce whose broadcast outcome is unknown.
    /// Fails safe toward skipping the nonce rather than reusing it.
    pub async fn burn(&self, chain: &str, account: Address, nonce: u64) -> Result<()> {
        warn!(
            chain = chain,
            account = %account,
            nonce = nonce,
            "Burning nonce after unknown broadcast outcome"
        );
        self.commit(chain, account, nonce).await
    }

    fn state_for<'a>(
        accounts: &'a mut HashMap<NonceKey, AccountState>,
        chain: &str,
        account: Address,
        nonce: u64,
    ) -> Result<&'a mut AccountState> {
        let key = NonceKey {
            chain: chain.to_string(),
            account,
        };
        accounts.get_mut(&key).ok_or(EngineError::NonceConflict {
            chain: chain.to_string(),
            account,
            message: format!("nonce {nonce} touched before any reservation"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::MockRpc;
    use std::sync::Arc;

    const CHAIN: &str = "base";

    fn account() -> Address {
        Address::repeat_byte(0x42)
    }

    #[tokio::test]
    async fn test_seeds_from_pending_count() {
        let rpc = MockRpc::new().with_transaction_count(account(), 17);
        let sequencer = NonceSequencer::new();

        assert_eq!(sequencer.reserve(&rpc, CHAIN, account()).await.unwrap(), 17);
        assert_eq!(sequencer.reserve(&rpc, CHAIN, account()).await.unwrap(), 18);
    }

    #[tokio::test]
    async fn test_concurrent_reservations_are_distinct_and_gapless() {
        let rpc = MockRpc::new().with_transaction_count(account(), 5);
        let sequencer = Arc::new(NonceSequencer::new());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let sequencer = Arc::clone(&sequencer);
            let rpc = rpc.clone();
            handles.push(tokio::spawn(async move {
                sequencer.reserve(&rpc, CHAIN, account()).await.unwrap()
            }));
        }

        let mut nonces = Vec::new();
        for handle in handles {
            nonces.push(handle.await.unwrap());
        }
        nonces.sort_unstable();

        let expected: Vec<u64> = (5..21).collect();
        assert_eq!(nonces, expected);
    }

    #[tokio::test]
    async fn test_released_nonce_reissued_before_fresh() {
        let rpc = MockRpc::new();
        let sequencer = NonceSequencer::new();

        let first = sequencer.reserve(&rpc, CHAIN, account()).await.unwrap();
        let second = sequencer.reserve(&rpc, CHAIN, account()).await.unwrap();
        assert_eq!((first, second), (0, 1));

        sequencer.release(CHAIN, account(), first).await.unwrap();
        assert_eq!(sequencer.reserve(&rpc, CHAIN, account()).await.unwrap(), 0);
        assert_eq!(sequencer.reserve(&rpc, CHAIN, account()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_burned_nonce_is_never_reissued() {
        let rpc = MockRpc::new();
        let sequencer = NonceSequencer::new();

        let nonce = sequencer.reserve(&rpc, CHAIN, account()).await.unwrap();
        sequencer.burn(CHAIN, account(), nonce).await.unwrap();

        assert_eq!(
            sequencer.reserve(&rpc, CHAIN, account()).await.unwrap(),
            nonce + 1
        );
    }

    #[tokio::test]
    async fn test_release_of_unreserved_nonce_is_a_conflict() {
        let rpc = MockRpc::new();
        let sequencer = NonceSequencer::new();

        let nonce = sequencer.reserve(&rpc, CHAIN, account()).await.unwrap();
        sequencer.commit(CHAIN, account(), nonce).await.unwrap();

        let err = sequencer.release(CHAIN, account(), nonce).await.unwrap_err();
        assert!(matches!(err, EngineError::NonceConflict { .. }));
    }

    #[tokio::test]
    async fn test_accounts_are_independent() {
        let other = Address::repeat_byte(0x43);
        let rpc = MockRpc::new()
            .with_transaction_count(account(), 10)
            .with_transaction_count(other, 99);
        let sequencer = NonceSequencer::new();

        assert_eq!(sequencer.reserve(&rpc, CHAIN, account()).await.unwrap(), 10);
        assert_eq!(sequencer.reserve(&rpc, CHAIN, other).await.unwrap(), 99);
        // same account on a different chain is its own counter
        assert_eq!(
            sequencer.reserve(&rpc, "ethereum", account()).await.unwrap(),
            10
        );
    }
}
