use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    /// Log every SQL statement at info (otherwise only slow ones at warn).
    pub debug: bool,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct EthereumConfig {
    pub rpc_urls: Vec<String>,
    pub chain_id: i64,
    /// EVM 0x-address of the staking contract.
    pub contract_address: String,
    pub confirmations: i64,
    /// Cursor bootstrap height (contract deployment block).
    pub start_block: i64,
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Cap on blocks processed per tick.
    pub batch_size: i64,
    pub scan_interval: Duration,
    pub scan_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub ethereum: EthereumConfig,
    pub scanner: ScannerConfig,
}

#[derive(Debug, Deserialize)]
struct DatabaseEnv {
    url: String,
    debug: Option<bool>,
    max_connections: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct EthereumEnv {
    #[serde(rename = "rpc_urls")]
    rpc_urls_raw: String,
    chain_id: i64,
    contract_address: String,
    confirmations: Option<i64>,
    start_block: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ScannerEnv {
    batch_size: i64,
    scan_interval_secs: u64,
    scan_timeout_secs: u64,
}

impl Default for ScannerEnv {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            scan_timeout_secs: DEFAULT_SCAN_TIMEOUT_SECS,
        }
    }
}

pub fn load_config() -> Result<AppConfig> {
    let database_env: DatabaseEnv = envy::prefixed("DATABASE_")
        .from_env()
        .context("load DATABASE_* env config")?;
    if database_env.url.trim().is_empty() {
        anyhow::bail!("DATABASE_URL must be set");
    }

    let ethereum_env: EthereumEnv = envy::prefixed("ETHEREUM_")
        .from_env()
        .context("load ETHEREUM_* env config")?;

    let scanner_env: ScannerEnv = envy::prefixed("SCANNER_")
        .from_env()
        .context("load SCANNER_* env config")?;

    let rpc_urls = parse_list(&ethereum_env.rpc_urls_raw);
    if rpc_urls.is_empty() {
        anyhow::bail!("ETHEREUM_RPC_URLS must not be empty");
    }

    ethereum_env
        .contract_address
        .parse::<alloy::primitives::Address>()
        .with_context(|| {
            format!(
                "invalid ETHEREUM_CONTRACT_ADDRESS: {}",
                ethereum_env.contract_address
            )
        })?;

    if ethereum_env.chain_id <= 0 {
        anyhow::bail!("ETHEREUM_CHAIN_ID must be positive");
    }

    let confirmations = ethereum_env.confirmations.unwrap_or(DEFAULT_CONFIRMATIONS);
    if confirmations < 0 {
        anyhow::bail!("ETHEREUM_CONFIRMATIONS must not be negative");
    }

    let start_block = ethereum_env.start_block.unwrap_or(0);
    if start_block < 0 {
        anyhow::bail!("ETHEREUM_START_BLOCK must not be negative");
    }

    Ok(AppConfig {
        database: DatabaseConfig {
            url: database_env.url,
            debug: database_env.debug.unwrap_or(false),
            max_connections: database_env
                .max_connections
                .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
                .max(1),
        },
        ethereum: EthereumConfig {
            rpc_urls,
            chain_id: ethereum_env.chain_id,
            contract_address: ethereum_env.contract_address.to_lowercase(),
            confirmations,
            start_block,
        },
        scanner: ScannerConfig {
            batch_size: scanner_env.batch_size.max(1),
            scan_interval: Duration::from_secs(scanner_env.scan_interval_secs.max(1)),
            scan_timeout: Duration::from_secs(scanner_env.scan_timeout_secs.max(1)),
        },
    })
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.replace(',', " ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_CONFIRMATIONS: i64 = 12;
const DEFAULT_BATCH_SIZE: i64 = 100;
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 5;
const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 30;
