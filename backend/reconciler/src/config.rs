//! Application configuration loaded from environment variables.

use std::str::FromStr;

use crate::errors::{ReconcilerError, Result};

/// Which [`LedgerClient`](crate::ledger::LedgerClient) the process runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerMode {
    /// Live Soroban network through the `stellar` CLI and JSON-RPC.
    Soroban,
    /// In-memory escrow book; for local development.
    Mock,
    /// No ledger client; every ledger step takes the no-client branch.
    None,
}

impl FromStr for LedgerMode {
    type Err = ReconcilerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "soroban" => Ok(Self::Soroban),
            "mock" => Ok(Self::Mock),
            "none" => Ok(Self::None),
            other => Err(ReconcilerError::Config(format!(
                "Invalid LEDGER_MODE {other:?} (expected soroban, mock or none)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    pub ledger_mode: LedgerMode,
    /// Soroban RPC endpoint (e.g. https://soroban-testnet.stellar.org)
    pub rpc_url: String,
    pub network_passphrase: String,
    /// The campaign escrow contract address (Strkey format)
    pub contract_id: String,
    /// The funding token (Stellar asset contract) address
    pub token_id: String,
    /// `stellar` CLI binary used for contract invocations
    pub stellar_cli: String,
    /// CLI identity holding the contract's deployer role
    pub deployer_identity: String,
    /// CLI identity holding the contract's releaser role
    pub releaser_identity: String,
    /// How often (in seconds) to poll the RPC for new events
    pub poll_interval_secs: u64,
    /// Maximum number of events to fetch per RPC request
    pub events_per_page: u32,
    /// Ledger to start from if no cursor is saved
    pub start_ledger: u32,
    /// Upper bound on waiting for a transaction receipt
    pub confirm_timeout_secs: u64,
    /// Upper bound on a single CLI invocation
    pub cli_timeout_secs: u64,
    /// Lifetime of a contributor's spending approval, in ledgers
    pub approval_ttl_ledgers: u32,
    /// Minimum number of votes before a proposal can be decided
    pub governance_quorum: u32,
    /// How often the failed-deploy sweeper runs
    pub retry_interval_secs: u64,
    /// Deploy attempts after which the sweeper gives up on a campaign
    pub max_deploy_attempts: u32,
    /// Platform fee used by the mock ledger
    pub mock_fee_bps: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let ledger_mode: LedgerMode = get("LEDGER_MODE", "mock").parse()?;
        let contract_id = get("CONTRACT_ID", "");
        let token_id = get("TOKEN_ID", "");
        if ledger_mode == LedgerMode::Soroban && (contract_id.is_empty() || token_id.is_empty()) {
            return Err(ReconcilerError::Config(
                "CONTRACT_ID and TOKEN_ID are required when LEDGER_MODE=soroban".to_string(),
            ));
        }

        let governance_quorum: u32 = parse(&lookup, "GOVERNANCE_QUORUM", "1")?;
        if governance_quorum == 0 {
            return Err(ReconcilerError::Config(
                "GOVERNANCE_QUORUM must be at least 1".to_string(),
            ));
        }

        let mock_fee_bps: u32 = parse(&lookup, "MOCK_FEE_BPS", "250")?;
        escrow_rules::check_fee_bps(mock_fee_bps)
            .map_err(|v| ReconcilerError::Config(format!("Invalid MOCK_FEE_BPS: {v}")))?;

        Ok(Config {
            database_url: get("DATABASE_URL", "sqlite:./campaigns.db"),
            api_port: parse(&lookup, "API_PORT", "3001")?,
            ledger_mode,
            rpc_url: get("RPC_URL", "https://soroban-testnet.stellar.org"),
            network_passphrase: get(
                "NETWORK_PASSPHRASE",
                "Test SDF Network ; September 2015",
            ),
            contract_id,
            token_id,
            stellar_cli: get("STELLAR_CLI", "stellar"),
            deployer_identity: get("DEPLOYER_IDENTITY", "deployer"),
            releaser_identity: get("RELEASER_IDENTITY", "releaser"),
            poll_interval_secs: parse(&lookup, "POLL_INTERVAL_SECS", "5")?,
            events_per_page: parse(&lookup, "EVENTS_PER_PAGE", "100")?,
            start_ledger: parse(&lookup, "START_LEDGER", "0")?,
            confirm_timeout_secs: parse(&lookup, "CONFIRM_TIMEOUT_SECS", "30")?,
            cli_timeout_secs: parse(&lookup, "CLI_TIMEOUT_SECS", "60")?,
            approval_ttl_ledgers: parse(&lookup, "APPROVAL_TTL_LEDGERS", "1000")?,
            governance_quorum,
            retry_interval_secs: parse(&lookup, "RETRY_INTERVAL_SECS", "60")?,
            max_deploy_attempts: parse(&lookup, "MAX_DEPLOY_ATTEMPTS", "5")?,
            mock_fee_bps,
        })
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: &str) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .unwrap_or_else(|| default.to_string())
        .parse()
        .map_err(|_| ReconcilerError::Config(format!("Invalid {key}")))
}
