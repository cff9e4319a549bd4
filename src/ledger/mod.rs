//! Append-only trade ledger on SQLite.
//!
//! One row per executed buy and per executed sell, keyed by contract
//! address and transaction hash. No updates, no deletes: the ledger is
//! an audit trail, and realized PnL is computed once at sell-record time
//! and immutable afterwards.
//!
//! Writes go through a database transaction, which also serializes the
//! buy-before-sell check per contract; reads are unrestricted.

use alloy_primitives::{Address, B256};
use anyhow::{Context, Result as AnyResult};
use chrono::Utc;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{EngineError, Result};

/// A recorded token purchase (an open position until a matching sell).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuyRecord {
    pub id: i64,
    pub contract_address: String,
    pub token_name: String,
    pub ticker: String,
    pub entry_price: f64,
    pub time_of_entry: i64,
    pub hash: String,
}

/// A recorded token sale with realized PnL.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SellRecord {
    pub id: i64,
    pub contract_address: String,
    pub exit_price: f64,
    pub time_of_exit: i64,
    pub hash: String,
    pub pnl: f64,
}

/// Ledger connection pool.
pub struct TradeLedger {
    pool: SqlitePool,
    /// SQLite rejects overlapping read-then-write transactions with
    /// SQLITE_LOCKED. All writes funnel through this guard so a
    /// concurrent signal queues instead of failing after its swap
    /// already broadcast.
    write_guard: Mutex<()>,
}

fn contract_key(address: Address) -> String {
    format!("{address:#x}")
}

fn hash_key(hash: B256) -> String {
    format!("{hash:#x}")
}

impl TradeLedger {
    /// Open (or create) the ledger database and run migrations.
    pub async fn new(database_url: &str) -> AnyResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to ledger database")?;

        let ledger = Self {
            pool,
            write_guard: Mutex::new(()),
        };
        ledger.run_migrations().await?;
        Ok(ledger)
    }

    async fn run_migrations(&self) -> AnyResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS buys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contract_address TEXT NOT NULL UNIQUE,
                token_name TEXT NOT NULL DEFAULT '',
                ticker TEXT NOT NULL DEFAULT '',
                entry_price REAL NOT NULL,
                time_of_entry INTEGER NOT NULL,
                hash TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sells (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contract_address TEXT NOT NULL UNIQUE,
                exit_price REAL NOT NULL,
                time_of_exit INTEGER NOT NULL,
                hash TEXT NOT NULL UNIQUE,
                pnl REAL NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_buys_hash ON buys(hash)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sells_hash ON sells(hash)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Record an executed buy. The contract address must not already
    /// hold a position (one open buy per contract).
    pub async fn record_buy(
        &self,
        contract: Address,
        token_name: &str,
        ticker: &str,
        entry_price: f64,
        hash: B256,
    ) -> Result<BuyRecord> {
        let contract = contract_key(contract);
        let hash = hash_key(hash);

        let _write = self.write_guard.lock().await;
        let mut tx = self.pool.begin().await?;

        let hash_taken: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM buys WHERE hash = ?")
            .bind(&hash)
            .fetch_optional(&mut *tx)
            .await?;
        if hash_taken.is_some() {
            return Err(EngineError::DuplicateHash(hash));
        }

        let contract_taken: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM buys WHERE contract_address = ?")
                .bind(&contract)
                .fetch_optional(&mut *tx)
                .await?;
        if contract_taken.is_some() {
            return Err(EngineError::DuplicateContract(contract));
        }

        let record = sqlx::query_as::<_, BuyRecord>(
            r#"
            INSERT INTO buys (contract_address, token_name, ticker, entry_price, time_of_entry, hash)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&contract)
        .bind(token_name)
        .bind(ticker)
        .bind(entry_price)
        .bind(Utc::now().timestamp())
        .bind(&hash)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(contract = %contract, ticker = ticker, entry_price = entry_price, "Recorded buy");
        Ok(record)
    }

    /// Record an executed sell against the open position for `contract`.
    /// Realized PnL is `(exit − entry) × quantity`, fixed at record time.
    pub async fn record_sell(
        &self,
        contract: Address,
        exit_price: f64,
        quantity: f64,
        hash: B256,
    ) -> Result<SellRecord> {
        let contract = contract_key(contract);
        let hash = hash_key(hash);

        let _write = self.write_guard.lock().await;
        let mut tx = self.pool.begin().await?;

        let buy: Option<BuyRecord> =
            sqlx::query_as("SELECT * FROM buys WHERE contract_address = ?")
                .bind(&contract)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(buy) = buy else {
            return Err(EngineError::NoOpenPosition(contract));
        };

        let already_closed: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM sells WHERE contract_address = ?")
                .bind(&contract)
                .fetch_optional(&mut *tx)
                .await?;
        if already_closed.is_some() {
            return Err(EngineError::NoOpenPosition(contract));
        }

        let hash_taken: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM sells WHERE hash = ?")
            .bind(&hash)
            .fetch_optional(&mut *tx)
            .await?;
        if hash_taken.is_some() {
            return Err(EngineError::DuplicateHash(hash));
        }

        let pnl = (exit_price - buy.entry_price) * quantity;

        let record = sqlx::query_as::<_, SellRecord>(
            r#"
            INSERT INTO sells (contract_address, exit_price, time_of_exit, hash, pnl)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&contract)
        .bind(exit_price)
        .bind(Utc::now().timestamp())
        .bind(&hash)
        .bind(pnl)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(contract = %contract, exit_price = exit_price, pnl = pnl, "Recorded sell");
        Ok(record)
    }

    pub async fn find_buy_by_contract(&self, contract: Address) -> Result<BuyRecord> {
        let contract = contract_key(contract);
        sqlx::query_as("SELECT * FROM buys WHERE contract_address = ?")
            .bind(&contract)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::NotFound(contract))
    }

    pub async fn find_buy_by_hash(&self, hash: B256) -> Result<BuyRecord> {
        let hash = hash_key(hash);
        sqlx::query_as("SELECT * FROM buys WHERE hash = ?")
            .bind(&hash)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::NotFound(hash))
    }

    pub async fn find_sell_by_contract(&self, contract: Address) -> Result<SellRecord> {
        let contract = contract_key(contract);
        sqlx::query_as("SELECT * FROM sells WHERE contract_address = ?")
            .bind(&contract)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::NotFound(contract))
    }

    pub async fn find_sell_by_hash(&self, hash: B256) -> Result<SellRecord> {
        let hash = hash_key(hash);
        sqlx::query_as("SELECT * FROM sells WHERE hash = ?")
            .bind(&hash)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::NotFound(hash))
    }

    /// Buys with no matching sell.
    pub async fn open_positions(&self) -> Result<Vec<BuyRecord>> {
        let rows = sqlx::query_as::<_, BuyRecord>(
            r#"
            SELECT b.* FROM buys b
            LEFT JOIN sells s ON s.contract_address = b.contract_address
            WHERE s.id IS NULL
            ORDER BY b.time_of_entry
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn all_sells(&self) -> Result<Vec<SellRecord>> {
        let rows = sqlx::query_as::<_, SellRecord>("SELECT * FROM sells ORDER BY time_of_exit")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Sum of realized PnL across all closed positions.
    pub async fn total_realized_pnl(&self) -> Result<f64> {
        let (total,): (f64,) = sqlx::query_as("SELECT COALESCE(SUM(pnl), 0) FROM sells")
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }
}
