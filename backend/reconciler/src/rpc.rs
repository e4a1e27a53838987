//! Soroban JSON-RPC client: `getEvents`, `getTransaction`, `getLatestLedger`.
//!
//! ## Resilience
//!
//! * `getEvents` applies exponential back-off when the RPC returns an error or
//!   rate-limit response, up to [`MAX_BACKOFF_SECS`] seconds.
//! * Transient network errors (connection reset, timeout) are retried silently.
//! * `getTransaction` and `getLatestLedger` make a single attempt; receipt
//!   polling is driven by the caller.

use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::events::{EventEnvelope, EventKind, LedgerEvent};
use crate::ledger::LedgerError;

const MAX_BACKOFF_SECS: u64 = 60;
const INITIAL_BACKOFF_SECS: u64 = 2;

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RpcResponse<T> {
    pub result: Option<T>,
    pub error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    /// -32600 / -32601 are request-shape failures that no retry will fix.
    fn is_hard(&self) -> bool {
        self.code == -32600 || self.code == -32601
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsResult {
    pub events: Vec<RawEvent>,
    pub cursor: Option<String>,
    #[serde(rename = "latestLedger")]
    pub latest_ledger: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawEvent {
    /// Topic list as rendered by the RPC
    pub topic: Vec<String>,
    /// Event value / data
    pub value: Value,
    #[serde(rename = "txHash")]
    pub tx_hash: Option<String>,
    pub ledger: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TransactionResult {
    status: String,
    ledger: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LatestLedgerResult {
    sequence: u64,
}

/// Outcome of a `getTransaction` lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Success { ledger: i64 },
    NotFound,
    Failed,
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RpcClient {
    client: Client,
    rpc_url: String,
    contract_id: String,
}

impl RpcClient {
    pub fn new(client: Client, rpc_url: impl Into<String>, contract_id: impl Into<String>) -> Self {
        Self {
            client,
            rpc_url: rpc_url.into(),
            contract_id: contract_id.into(),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, LedgerError> {
        let resp = self
            .client
            .post(&self.rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await
            .map_err(|e| LedgerError::Network(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LedgerError::Network("rate-limited by RPC".to_string()));
        }

        let body: RpcResponse<T> = resp
            .json()
            .await
            .map_err(|e| LedgerError::Decode(e.to_string()))?;

        if let Some(err) = body.error {
            let message = format!("RPC error {}: {}", err.code, err.message);
            return Err(if err.is_hard() {
                LedgerError::Decode(message)
            } else {
                LedgerError::Network(message)
            });
        }
        body.result
            .ok_or_else(|| LedgerError::Decode(format!("empty result from {method}")))
    }

    /// Fetch a page of escrow events.
    ///
    /// * `start_ledger`: the ledger sequence to scan from (inclusive).
    /// * `cursor`: optional opaque pagination cursor from a previous response.
    /// * `limit`: maximum number of events to return.
    ///
    /// Returns `(events, next_cursor, latest_ledger)`.
    pub async fn fetch_events(
        &self,
        start_ledger: u32,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<(Vec<RawEvent>, Option<String>, Option<u64>), LedgerError> {
        let mut backoff = INITIAL_BACKOFF_SECS;

        loop {
            let params = build_params(&self.contract_id, start_ledger, cursor, limit);
            match self.call::<EventsResult>("getEvents", params).await {
                Ok(result) => {
                    debug!(
                        "Fetched {} events (latest_ledger={:?})",
                        result.events.len(),
                        result.latest_ledger
                    );
                    return Ok((result.events, result.cursor, result.latest_ledger));
                }
                Err(e) if e.is_retryable() => {
                    warn!("getEvents failed (will retry in {backoff}s): {e}");
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get_transaction(&self, tx_hash: &str) -> Result<TxStatus, LedgerError> {
        let result: TransactionResult = self
            .call("getTransaction", json!({ "hash": tx_hash }))
            .await?;
        Ok(match result.status.as_str() {
            "SUCCESS" => TxStatus::Success {
                ledger: result.ledger.unwrap_or(0) as i64,
            },
            "NOT_FOUND" => TxStatus::NotFound,
            _ => TxStatus::Failed,
        })
    }

    pub async fn latest_ledger(&self) -> Result<u64, LedgerError> {
        let result: LatestLedgerResult = self.call("getLatestLedger", json!({})).await?;
        Ok(result.sequence)
    }
}

fn build_params(contract_id: &str, start_ledger: u32, cursor: Option<&str>, limit: u32) -> Value {
    let mut params = json!({
        "filters": [
            {
                "type": "contract",
                "contractIds": [contract_id]
            }
        ],
        "pagination": {
            "limit": limit
        }
    });

    if let Some(cur) = cursor {
        params["pagination"]["cursor"] = json!(cur);
    } else {
        params["startLedger"] = json!(start_ledger);
    }

    params
}

// ─────────────────────────────────────────────────────────
// Event decoding
// ─────────────────────────────────────────────────────────

/// Decode raw RPC events into typed envelopes. Events we don't recognise, or
/// that lack a tx hash, are skipped.
pub fn decode_events(raw: &[RawEvent]) -> Vec<EventEnvelope> {
    raw.iter()
        .filter_map(|e| {
            let decoded = decode_single(e);
            if decoded.is_none() {
                debug!("Skipping undecodable event: topics={:?}", e.topic);
            }
            decoded
        })
        .collect()
}

fn decode_single(raw: &RawEvent) -> Option<EventEnvelope> {
    let first_topic = raw.topic.first()?;
    let kind = EventKind::from_topic(&extract_symbol(first_topic));
    let campaign_id = extract_u64(raw.topic.get(1)?)?;
    let tx_hash = raw.tx_hash.clone()?;
    let v = &raw.value;

    let event = match kind {
        EventKind::EscrowCreated => LedgerEvent::EscrowCreated {
            campaign_id,
            owner: extract_str(v, "owner").or_else(|| find_nested(v, "owner"))?,
            goal: extract_i64(v, "goal")?,
            milestones_total: extract_i64(v, "milestones_total")? as u32,
        },
        EventKind::ContributionReceived => LedgerEvent::ContributionReceived {
            campaign_id,
            contributor: extract_str(v, "contributor").or_else(|| find_nested(v, "contributor"))?,
            amount: extract_i64(v, "amount")?,
            funded: extract_i64(v, "funded")?,
        },
        EventKind::EvidenceSubmitted => LedgerEvent::EvidenceSubmitted {
            campaign_id,
            index: extract_i64(v, "index")? as u32,
        },
        EventKind::MilestoneReleased => LedgerEvent::MilestoneReleased {
            campaign_id,
            index: extract_i64(v, "index")? as u32,
            amount: extract_i64(v, "amount")?,
            fee: extract_i64(v, "fee")?,
            researcher_amount: extract_i64(v, "researcher_amount")?,
        },
        EventKind::Unknown => return None,
    };

    Some(EventEnvelope {
        tx_hash,
        ledger: raw.ledger.unwrap_or(0) as i64,
        event,
    })
}

fn extract_str(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(String::from)
}

/// Amounts arrive as JSON numbers or, for `i128`, as strings.
fn extract_i64(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn find_nested(value: &Value, key: &str) -> Option<String> {
    if let Value::Object(map) = value {
        for (k, v) in map {
            if k == key {
                return v.as_str().map(String::from);
            }
            if let Some(found) = find_nested(v, key) {
                return Some(found);
            }
        }
    }
    None
}

/// Extract a Soroban Symbol from the decoded topic string.
/// The RPC may return `{"type":"symbol","value":"created"}` or just the raw string.
fn extract_symbol(raw: &str) -> String {
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        if let Some(s) = v.get("value").and_then(|x| x.as_str()) {
            return s.to_string();
        }
    }
    raw.to_string()
}

/// Extract the campaign id from a topic entry that might be a JSON object or
/// a bare number.
fn extract_u64(raw: &str) -> Option<u64> {
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        let inner = v.get("value").unwrap_or(&v);
        if let Some(n) = inner.as_u64() {
            return Some(n);
        }
        if let Some(s) = inner.as_str() {
            return s.parse().ok();
        }
    }
    raw.parse().ok()
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
