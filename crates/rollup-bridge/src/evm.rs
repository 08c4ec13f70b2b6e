//! Deposit watcher for an EVM parent chain, over JSON-RPC.

use std::time::Duration;

use async_trait::async_trait;
use rollup_core::{decode_hex, normalize_hex, now_ms, Address};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{BridgeConfig, BridgeError, DepositEvent, DepositWatcher};

/// ABI word size.
const WORD: usize = 32;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Subset of an `eth_getLogs` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub transaction_hash: String,
    pub log_index: String,
    pub data: String,
    #[serde(default)]
    pub removed: bool,
}

/// Polls `eth_getLogs` for deposit events emitted by one contract.
///
/// The cursor starts at the chain head seen on the first poll, so only
/// deposits emitted after startup are reported.
pub struct EvmLogWatcher {
    client: reqwest::Client,
    config: BridgeConfig,
    cursor: Mutex<Option<u64>>,
}

impl EvmLogWatcher {
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        if config.rpc_url.trim().is_empty() {
            return Err(BridgeError::Rpc("rpc_url is empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| BridgeError::Rpc(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            config,
            cursor: Mutex::new(None),
        })
    }

    async fn block_number(&self) -> Result<u64, BridgeError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        let quantity = result
            .as_str()
            .ok_or_else(|| BridgeError::Decode("eth_blockNumber result is not a string".into()))?;
        parse_quantity(quantity)
    }

    async fn get_logs(&self, from: u64, to: u64) -> Result<Vec<RawLog>, BridgeError> {
        let result = self
            .call("eth_getLogs", json!([log_filter(&self.config, from, to)]))
            .await?;
        serde_json::from_value(result).map_err(|e| BridgeError::Decode(e.to_string()))
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };
        let attempts = self.config.retry_max.max(1);
        let mut last_err = BridgeError::Rpc("no attempt made".to_string());
        for attempt in 1..=attempts {
            match self.send(&request).await {
                Ok(value) => return Ok(value),
                Err(err @ BridgeError::Rpc(_)) => {
                    warn!(method, attempt, error = %err, "rpc request failed");
                    last_err = err;
                    if attempt < attempts {
                        backoff(attempt).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    async fn send(&self, request: &RpcRequest<'_>) -> Result<Value, BridgeError> {
        let resp = self
            .client
            .post(&self.config.rpc_url)
            .json(request)
            .send()
            .await
            .map_err(|e| BridgeError::Rpc(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BridgeError::Rpc(format!("http status {}", status.as_u16())));
        }
        let body: RpcResponse = resp
            .json()
            .await
            .map_err(|e| BridgeError::Decode(e.to_string()))?;
        if let Some(err) = body.error {
            return Err(BridgeError::Rpc(format!("{} (code {})", err.message, err.code)));
        }
        body.result
            .ok_or_else(|| BridgeError::Decode(format!("{} returned no result", request.method)))
    }
}

#[async_trait]
impl DepositWatcher for EvmLogWatcher {
    async fn poll_deposits(&self) -> Result<Vec<DepositEvent>, BridgeError> {
        let head = self.block_number().await?;
        let mut cursor = self.cursor.lock().await;
        let from = match *cursor {
            None => {
                info!(head, contract = %self.config.contract, "deposit watcher starting at head");
                *cursor = Some(head);
                return Ok(Vec::new());
            }
            Some(seen) if head <= seen => return Ok(Vec::new()),
            Some(seen) => seen.saturating_add(1),
        };

        let logs = self.get_logs(from, head).await?;
        *cursor = Some(head);
        debug!(from, to = head, logs = logs.len(), "fetched deposit logs");

        let observed_at_ms = now_ms();
        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match decode_deposit_log(log, observed_at_ms) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(err) => warn!(
                    l1_tx_hash = %log.transaction_hash,
                    error = %err,
                    "dropping undecodable deposit log"
                ),
            }
        }
        Ok(events)
    }
}

fn log_filter(config: &BridgeConfig, from: u64, to: u64) -> Value {
    let mut filter = json!({
        "address": config.contract,
        "fromBlock": format!("{from:#x}"),
        "toBlock": format!("{to:#x}"),
    });
    if !config.deposit_topic.trim().is_empty() {
        filter["topics"] = json!([format!("0x{}", normalize_hex(&config.deposit_topic))]);
    }
    filter
}

/// Parse a JSON-RPC hex quantity such as `0x1a`.
pub fn parse_quantity(s: &str) -> Result<u64, BridgeError> {
    let body = normalize_hex(s);
    if body.is_empty() {
        return Err(BridgeError::Decode(format!("empty quantity {s:?}")));
    }
    u64::from_str_radix(&body, 16).map_err(|e| BridgeError::Decode(format!("{s:?}: {e}")))
}

/// Decode a deposit log whose data is `bytes32 layer2Address, uint256 amount`.
/// Removed (reorged) logs yield `None`.
pub fn decode_deposit_log(
    log: &RawLog,
    observed_at_ms: u64,
) -> Result<Option<DepositEvent>, BridgeError> {
    if log.removed {
        return Ok(None);
    }
    let data = decode_hex(&log.data).map_err(|e| BridgeError::Decode(e.to_string()))?;
    if data.len() < 2 * WORD {
        return Err(BridgeError::Decode(format!(
            "deposit data has {} bytes, expected {}",
            data.len(),
            2 * WORD
        )));
    }
    let mut address = [0u8; WORD];
    address.copy_from_slice(&data[..WORD]);
    let amount_word = &data[WORD..2 * WORD];
    if amount_word[..WORD - 8].iter().any(|b| *b != 0) {
        return Err(BridgeError::Decode("deposit amount exceeds u64".to_string()));
    }
    let mut amount = [0u8; 8];
    amount.copy_from_slice(&amount_word[WORD - 8..]);

    Ok(Some(DepositEvent {
        l1_tx_hash: format!("0x{}", normalize_hex(&log.transaction_hash)),
        log_index: parse_quantity(&log.log_index)?,
        address: Address(address),
        amount: u64::from_be_bytes(amount),
        observed_at_ms,
    }))
}

async fn backoff(attempt: u32) {
    let delay_ms = 100u64.saturating_mul(u64::from(attempt));
    sleep(Duration::from_millis(delay_ms)).await;
}
