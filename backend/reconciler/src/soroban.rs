//! [`LedgerClient`] backed by a live Soroban network.
//!
//! Writes and simulated reads go through the `stellar contract invoke` CLI,
//! which handles signing and transaction assembly. Receipts, events and the
//! latest ledger sequence come straight from the JSON-RPC endpoint.
//!
//! Every CLI invocation runs as a child process bounded by
//! `CLI_TIMEOUT_SECS`; the child is killed if the wait is abandoned.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::Config;
use crate::ledger::{
    Confirmation, ContributeRequest, DeployRequest, EscrowSnapshot, EventCursor, EventPage,
    LedgerClient, LedgerError, ReleaseReceipt, Submitted,
};
use crate::rpc::{self, RpcClient, TxStatus};

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct SorobanLedger {
    cli: String,
    rpc_url: String,
    network_passphrase: String,
    contract_id: String,
    token_id: String,
    deployer: String,
    releaser: String,
    cli_timeout: Duration,
    approval_ttl_ledgers: u32,
    rpc: RpcClient,
}

/// What a successful CLI invocation printed.
#[derive(Debug)]
struct Invocation {
    stdout: String,
    tx_hash: Option<String>,
}

impl Invocation {
    fn submitted<T>(self, value: T) -> Result<Submitted<T>, LedgerError> {
        let tx_hash = self
            .tx_hash
            .ok_or_else(|| LedgerError::Decode("no transaction hash in CLI output".to_string()))?;
        Ok(Submitted { tx_hash, value })
    }

    fn parse<T: DeserializeOwned>(&self) -> Result<T, LedgerError> {
        serde_json::from_str(self.stdout.trim())
            .map_err(|e| LedgerError::Decode(format!("{e}: {}", self.stdout.trim())))
    }
}

impl SorobanLedger {
    pub fn new(config: &Config, http: reqwest::Client) -> Self {
        Self {
            cli: config.stellar_cli.clone(),
            rpc_url: config.rpc_url.clone(),
            network_passphrase: config.network_passphrase.clone(),
            contract_id: config.contract_id.clone(),
            token_id: config.token_id.clone(),
            deployer: config.deployer_identity.clone(),
            releaser: config.releaser_identity.clone(),
            cli_timeout: Duration::from_secs(config.cli_timeout_secs),
            approval_ttl_ledgers: config.approval_ttl_ledgers,
            rpc: RpcClient::new(http, &config.rpc_url, &config.contract_id),
        }
    }

    async fn invoke(
        &self,
        contract: &str,
        source: &str,
        send: bool,
        args: &[String],
    ) -> Result<Invocation, LedgerError> {
        let mut cmd = Command::new(&self.cli);
        cmd.args(["contract", "invoke", "--id", contract])
            .args(["--source-account", source])
            .args(["--rpc-url", self.rpc_url.as_str()])
            .args(["--network-passphrase", self.network_passphrase.as_str()]);
        if !send {
            cmd.arg("--send=no");
        }
        cmd.arg("--").args(args).kill_on_drop(true);

        debug!("stellar invoke {contract} {}", args.join(" "));
        let output = tokio::time::timeout(self.cli_timeout, cmd.output())
            .await
            .map_err(|_| LedgerError::Timeout)?
            .map_err(|e| LedgerError::Network(format!("failed to run {}: {e}", self.cli)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            if let Some(code) = parse_contract_error(&stderr) {
                return Err(LedgerError::from_code(code));
            }
            let message = stderr.trim().to_string();
            warn!("stellar invoke failed: {message}");
            return Err(LedgerError::Network(message));
        }

        let tx_hash = extract_tx_hash(&stderr).or_else(|| extract_tx_hash(&stdout));
        Ok(Invocation { stdout, tx_hash })
    }
}

#[async_trait]
impl LedgerClient for SorobanLedger {
    async fn deploy(&self, req: &DeployRequest) -> Result<Submitted<EscrowSnapshot>, LedgerError> {
        let milestones: Vec<String> = req.milestones.iter().map(i64::to_string).collect();
        let args = vec![
            "deploy_campaign".to_string(),
            "--campaign_id".to_string(),
            req.campaign_id.to_string(),
            "--owner".to_string(),
            req.owner.clone(),
            "--goal".to_string(),
            req.goal.to_string(),
            "--milestones".to_string(),
            serde_json::to_string(&milestones).map_err(|e| LedgerError::Decode(e.to_string()))?,
        ];
        let out = self
            .invoke(&self.contract_id, &self.deployer, true, &args)
            .await?;
        let snapshot = out.parse()?;
        out.submitted(snapshot)
    }

    async fn approve_spend(&self, contributor: &str, amount: i64) -> Result<Submitted<()>, LedgerError> {
        let expiration = self.rpc.latest_ledger().await? + u64::from(self.approval_ttl_ledgers);
        let args = vec![
            "approve".to_string(),
            "--from".to_string(),
            contributor.to_string(),
            "--spender".to_string(),
            self.contract_id.clone(),
            "--amount".to_string(),
            amount.to_string(),
            "--expiration_ledger".to_string(),
            expiration.to_string(),
        ];
        self.invoke(&self.token_id, contributor, true, &args)
            .await?
            .submitted(())
    }

    async fn contribute(&self, req: &ContributeRequest) -> Result<Submitted<i64>, LedgerError> {
        let args = vec![
            "contribute".to_string(),
            "--campaign_id".to_string(),
            req.campaign_id.to_string(),
            "--contributor".to_string(),
            req.contributor.clone(),
            "--amount".to_string(),
            req.amount.to_string(),
        ];
        let out = self
            .invoke(&self.contract_id, &req.contributor, true, &args)
            .await?;
        let funded = parse_amount(&out.stdout)?;
        out.submitted(funded)
    }

    async fn submit_evidence(
        &self,
        campaign_id: u64,
        index: u32,
        evidence_hash: [u8; 32],
    ) -> Result<Submitted<()>, LedgerError> {
        let args = vec![
            "submit_evidence".to_string(),
            "--caller".to_string(),
            self.releaser.clone(),
            "--campaign_id".to_string(),
            campaign_id.to_string(),
            "--index".to_string(),
            index.to_string(),
            "--evidence_hash".to_string(),
            hex::encode(evidence_hash),
        ];
        self.invoke(&self.contract_id, &self.releaser, true, &args)
            .await?
            .submitted(())
    }

    async fn release_milestone(
        &self,
        campaign_id: u64,
        index: u32,
    ) -> Result<Submitted<ReleaseReceipt>, LedgerError> {
        let args = vec![
            "release_milestone".to_string(),
            "--campaign_id".to_string(),
            campaign_id.to_string(),
            "--index".to_string(),
            index.to_string(),
        ];
        let out = self
            .invoke(&self.contract_id, &self.releaser, true, &args)
            .await?;
        let receipt = out.parse()?;
        out.submitted(receipt)
    }

    async fn confirm(&self, tx_hash: &str) -> Result<Confirmation, LedgerError> {
        loop {
            match self.rpc.get_transaction(tx_hash).await? {
                TxStatus::Success { ledger } => return Ok(Confirmation { ledger }),
                TxStatus::Failed => {
                    return Err(LedgerError::Reverted {
                        code: None,
                        message: format!("transaction {tx_hash} failed"),
                    })
                }
                TxStatus::NotFound => tokio::time::sleep(RECEIPT_POLL_INTERVAL).await,
            }
        }
    }

    async fn escrow(&self, campaign_id: u64) -> Result<Option<EscrowSnapshot>, LedgerError> {
        let args = vec![
            "get_escrow".to_string(),
            "--campaign_id".to_string(),
            campaign_id.to_string(),
        ];
        match self
            .invoke(&self.contract_id, &self.deployer, false, &args)
            .await
        {
            Ok(out) => out.parse().map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn events(&self, cursor: &EventCursor, limit: u32) -> Result<EventPage, LedgerError> {
        let (raw, next_cursor, latest_ledger) = self
            .rpc
            .fetch_events(cursor.start_ledger, cursor.cursor.as_deref(), limit)
            .await?;
        Ok(EventPage {
            events: rpc::decode_events(&raw),
            next_cursor,
            latest_ledger,
        })
    }
}

/// First 64-character hex token in the CLI output.
fn extract_tx_hash(text: &str) -> Option<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .find(|tok| tok.len() == 64 && tok.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_ascii_lowercase)
}

/// Contract error code from a CLI failure such as
/// `HostError: Error(Contract, #11)`.
fn parse_contract_error(stderr: &str) -> Option<u32> {
    const MARKER: &str = "Error(Contract, #";
    let start = stderr.find(MARKER)? + MARKER.len();
    let digits: String = stderr[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// `i128` return values print as a quoted JSON string.
fn parse_amount(stdout: &str) -> Result<i64, LedgerError> {
    let trimmed = stdout.trim().trim_matches('"');
    trimmed
        .parse()
        .map_err(|_| LedgerError::Decode(format!("expected an amount, got {trimmed:?}")))
}
