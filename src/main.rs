//! EVM copy-trade execution engine.
//!
//! Consumes trade signals ("buy token T on chain C") and replicates
//! them on-chain: quoted, slippage-bounded, nonce-safe Uniswap V2
//! swaps, recorded in an append-only ledger for PnL tracking.

mod abi;
mod chain;
mod engine;
mod error;
mod executor;
mod ledger;
mod models;
mod nonce;
mod oracle;
mod quote;
mod rpc;

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use alloy_signer_local::PrivateKeySigner;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::chain::{base_from_env, ChainConfig, ChainRegistry};
use crate::engine::Engine;
use crate::executor::{parse_signer, SwapExecutor};
use crate::ledger::TradeLedger;
use crate::models::{eth_to_wei, wei_to_eth, TradeDirection, TradeSignal};
use crate::nonce::NonceSequencer;
use crate::oracle::PriceOracle;
use crate::quote::QuoteEstimator;
use crate::rpc::HttpRpc;

/// Copy-trade execution engine CLI.
#[derive(Parser)]
#[command(name = "copytrader")]
#[command(about = "Replicate tracked-wallet swaps on EVM chains", long_about = None)]
struct Cli {
    /// Ledger database path
    #[arg(short, long, default_value = "sqlite:./copytrader.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional JSON file with extra chain configs to register
    #[arg(long)]
    chains: Option<String>,

    /// Signing key, hex with or without 0x prefix
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered chains
    Chains,

    /// Show the signing account's native balance on a chain
    Balance {
        /// Chain name
        #[arg(short, long, default_value = "base")]
        chain: String,
    },

    /// Quote a native -> token swap without executing it
    Quote {
        /// Token contract address
        token: String,

        /// Chain name
        #[arg(short, long, default_value = "base")]
        chain: String,

        /// Native-asset input amount (e.g. 0.1)
        #[arg(short, long)]
        amount: Decimal,

        /// Slippage tolerance percentage
        #[arg(short, long, default_value = "2")]
        slippage: Decimal,
    },

    /// Buy a token with the native asset
    Buy {
        /// Token contract address
        token: String,

        /// Chain name
        #[arg(short, long, default_value = "base")]
        chain: String,

        /// Native-asset input amount (e.g. 0.1)
        #[arg(short, long)]
        amount: Decimal,

        /// Slippage tolerance percentage
        #[arg(short, long, default_value = "2")]
        slippage: Decimal,

        /// Block until the swap is mined
        #[arg(long)]
        wait: bool,
    },

    /// Sell a previously bought token back to the native asset
    Sell {
        /// Token contract address
        token: String,

        /// Chain name
        #[arg(short, long, default_value = "base")]
        chain: String,

        /// Token amount in base units; the full balance when omitted
        #[arg(short, long)]
        amount: Option<String>,

        /// Slippage tolerance percentage
        #[arg(short, long, default_value = "2")]
        slippage: Decimal,

        /// Block until the swap is mined
        #[arg(long)]
        wait: bool,
    },

    /// Approve the router to move a token (sell does this implicitly)
    Approve {
        /// Token contract address
        token: String,

        /// Chain name
        #[arg(short, long, default_value = "base")]
        chain: String,

        /// Token amount in base units; unlimited when omitted
        #[arg(short, long)]
        amount: Option<String>,
    },

    /// List open positions from the ledger
    Positions,

    /// Show closed trades and realized PnL
    History,

    /// Consume trade signals as JSON lines on stdin and execute them
    Run {
        /// Block each worker until its swap is mined
        #[arg(long)]
        wait: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let registry = Arc::new(load_registry(&cli)?);

    match &cli.command {
        Commands::Chains => {
            println!("\n{:<12} {:>10} {:<44}", "NAME", "CHAIN ID", "ROUTER");
            println!("{}", "-".repeat(68));

            for name in registry.names() {
                let config = registry.resolve(name)?;
                println!(
                    "{:<12} {:>10} {:<44}",
                    config.name, config.chain_id, config.router
                );
            }
        }

        Commands::Balance { chain } => {
            let config = registry.resolve(chain)?;
            let rpc = connect(&registry, chain).await?;
            let signer = required_signer(&cli)?;

            let balance = rpc
                .balance(signer.address())
                .await
                .map_err(|e| anyhow::anyhow!("balance query failed: {e}"))?;
            let eth = wei_to_eth(balance).unwrap_or_default();

            println!("\nAccount: {}", signer.address());
            println!("Chain:   {} ({})", config.name, config.chain_id);
            println!("Balance: {} ETH", eth);

            if let Some(usd) = PriceOracle::new().usd_price("ethereum").await {
                println!("Value:   ${:.2}", eth * usd);
            }
        }

        Commands::Quote {
            token,
            chain,
            amount,
            slippage,
        } => {
            let config = registry.resolve(chain)?;
            let rpc = connect(&registry, chain).await?;
            let token = parse_address(token)?;
            let amount_wei = eth_to_wei(*amount).context("invalid amount")?;

            let estimator = QuoteEstimator::new(PriceOracle::new());
            let quote = estimator
                .estimate(
                    rpc.as_ref(),
                    config,
                    [config.wrapped_native, token],
                    amount_wei,
                    *slippage,
                )
                .await?;

            println!("\nExpected out: {}", quote.expected_out);
            println!("Minimum out:  {} ({}% slippage)", quote.minimum_out, slippage);
            match quote.usd_reference {
                Some(usd) => println!("USD price:    ${:.10} per token", usd),
                None => println!("USD price:    unavailable"),
            }
        }

        Commands::Buy {
            token,
            chain,
            amount,
            slippage,
            wait,
        } => {
            let token = parse_address(token)?;
            let amount_wei = eth_to_wei(*amount).context("invalid amount")?;
            let engine = build_engine(&cli, &registry, *wait).await?;

            let signal = TradeSignal::new(
                chain.clone(),
                TradeDirection::Buy,
                token,
                amount_wei,
                *slippage,
                "main",
            );
            let outcome = engine.process_signal(&signal).await?;

            println!("\nBuy broadcast: {}", outcome.hash);
            println!("Status: {:?}", outcome.status);
        }

        Commands::Sell {
            token,
            chain,
            amount,
            slippage,
            wait,
        } => {
            let token = parse_address(token)?;
            let amount: U256 = match amount {
                Some(a) => a.parse().context("invalid token amount")?,
                None => U256::ZERO, // engine sizes from the live balance
            };
            let engine = build_engine(&cli, &registry, *wait).await?;

            let signal = TradeSignal::new(
                chain.clone(),
                TradeDirection::Sell,
                token,
                amount,
                *slippage,
                "main",
            );
            let outcome = engine.process_signal(&signal).await?;

            println!("\nSell broadcast: {}", outcome.hash);
            println!("Status: {:?}", outcome.status);
        }

        Commands::Approve {
            token,
            chain,
            amount,
        } => {
            let config = registry.resolve(chain)?;
            let rpc = connect(&registry, chain).await?;
            let token = parse_address(token)?;
            let amount = match amount {
                Some(a) => a.parse().context("invalid token amount")?,
                None => U256::MAX,
            };
            let signer = required_signer(&cli)?;

            let executor = SwapExecutor::new(Arc::new(NonceSequencer::new()));
            let hash = executor
                .approve(rpc.as_ref(), config, &signer, token, config.router, amount)
                .await?;

            println!("\nApproval confirmed: {}", hash);
        }

        Commands::Positions => {
            let ledger = TradeLedger::new(&cli.database).await?;
            let positions = ledger.open_positions().await?;

            if positions.is_empty() {
                println!("No open positions.");
                return Ok(());
            }

            println!(
                "\n{:<44} {:<10} {:>14} {:>12}",
                "CONTRACT", "TICKER", "ENTRY PRICE", "ENTERED"
            );
            println!("{}", "-".repeat(84));

            for p in positions {
                println!(
                    "{:<44} {:<10} {:>14.8} {:>12}",
                    p.contract_address, p.ticker, p.entry_price, p.time_of_entry
                );
            }
        }

        Commands::History => {
            let ledger = TradeLedger::new(&cli.database).await?;
            let sells = ledger.all_sells().await?;

            if sells.is_empty() {
                println!("No closed trades.");
                return Ok(());
            }

            println!("\n{:<44} {:>14} {:>12}", "CONTRACT", "EXIT PRICE", "PNL");
            println!("{}", "-".repeat(74));

            for s in &sells {
                println!(
                    "{:<44} {:>14.8} {:>12.2}",
                    s.contract_address, s.exit_price, s.pnl
                );
            }

            println!(
                "\nTotal realized PnL: ${:.2}",
                ledger.total_realized_pnl().await?
            );
        }

        Commands::Run { wait } => {
            let engine = build_engine(&cli, &registry, *wait).await?;

            println!("\n=== Copy-Trade Engine ===");
            println!("Chains: {}", registry.names().join(", "));
            println!("Reading trade signals from stdin, one JSON object per line.");
            println!("Press Ctrl+D to stop.\n");

            let (tx, rx) = mpsc::channel::<TradeSignal>(64);

            let reader = tokio::spawn(async move {
                let stdin = BufReader::new(tokio::io::stdin());
                let mut lines = stdin.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<TradeSignal>(line.trim()) {
                        Ok(signal) => {
                            if tx.send(signal).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Discarding malformed trade signal"),
                    }
                }
            });

            engine.run(rx).await;
            reader.await.ok();
            info!("Signal stream closed, engine stopped");
        }
    }

    Ok(())
}

/// Builtin Base entry plus any chains from --chains.
fn load_registry(cli: &Cli) -> Result<ChainRegistry> {
    let mut registry = ChainRegistry::new();
    registry.register(base_from_env()?)?;

    if let Some(path) = &cli.chains {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read chains file {}", path))?;
        let configs: Vec<ChainConfig> =
            serde_json::from_str(&raw).context("malformed chains file")?;
        for config in configs {
            registry.register(config)?;
        }
    }

    Ok(registry)
}

/// Connect to a chain's RPC endpoint and verify its reported chain id.
async fn connect(registry: &ChainRegistry, chain: &str) -> Result<Arc<HttpRpc>> {
    let config = registry.resolve(chain)?;
    let rpc = HttpRpc::new(config.rpc_url.clone())
        .map_err(|e| anyhow::anyhow!("failed to build RPC client: {e}"))?;
    registry.verify(chain, &rpc).await?;
    Ok(Arc::new(rpc))
}

async fn build_engine(
    cli: &Cli,
    registry: &Arc<ChainRegistry>,
    wait: bool,
) -> Result<Arc<Engine<HttpRpc>>> {
    let signer = required_signer(cli)?;

    let mut rpcs = HashMap::new();
    for name in registry.names() {
        rpcs.insert(name.to_string(), connect(registry, name).await?);
    }

    let mut keyring = HashMap::new();
    keyring.insert("main".to_string(), signer);

    let executor = SwapExecutor::new(Arc::new(NonceSequencer::new()));
    let estimator = QuoteEstimator::new(PriceOracle::new());
    let ledger = Arc::new(TradeLedger::new(&cli.database).await?);

    Ok(Arc::new(Engine::new(
        Arc::clone(registry),
        rpcs,
        keyring,
        estimator,
        executor,
        ledger,
        wait,
    )))
}

fn required_signer(cli: &Cli) -> Result<PrivateKeySigner> {
    let key = cli
        .private_key
        .as_deref()
        .context("PRIVATE_KEY not set (env or --private-key)")?;
    Ok(parse_signer(key)?)
}

fn parse_address(s: &str) -> Result<Address> {
    s.parse()
        .with_context(|| format!("invalid contract address: {}", s))
}
