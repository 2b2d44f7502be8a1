use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use stx_send_core::domain::BroadcastReceipt;
use stx_send_core::{BroadcastPort, PortError, SignedTransaction, StacksAddress};

use crate::SendFlowConfig;

/// Balance and next nonce of an account, in µSTX.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountInfo {
    pub balance: u64,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBroadcast {
    pub txid: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct NodeClient {
    mode: NodeMode,
}

#[derive(Debug, Clone)]
enum NodeMode {
    Disabled(String),
    Recording(Arc<Mutex<RecordingState>>),
    Http(HttpRuntime),
}

#[derive(Debug, Clone)]
struct HttpRuntime {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Default)]
struct RecordingState {
    account: AccountInfo,
    sent: Vec<RecordedBroadcast>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balance: String,
    nonce: u64,
}

impl NodeClient {
    pub fn with_config(config: &SendFlowConfig) -> Self {
        let mode = match &config.node_url {
            Some(base_url) => match reqwest::Client::builder()
                .timeout(config.node_timeout())
                .build()
            {
                Ok(client) => NodeMode::Http(HttpRuntime {
                    base_url: base_url.trim_end_matches('/').to_owned(),
                    client,
                }),
                Err(e) => NodeMode::Disabled(format!("failed to initialize node client: {e}")),
            },
            None if config.strict_runtime_required() => NodeMode::Disabled(
                "node URL not configured in production runtime profile".to_owned(),
            ),
            None => {
                info!("no node URL configured, broadcasts are recorded only");
                NodeMode::Recording(Arc::default())
            }
        };
        Self { mode }
    }

    /// In-memory node that reports `account` and keeps every broadcast.
    pub fn recording(account: AccountInfo) -> Self {
        Self {
            mode: NodeMode::Recording(Arc::new(Mutex::new(RecordingState {
                account,
                sent: Vec::new(),
            }))),
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.mode, NodeMode::Recording(_))
    }

    pub fn set_recorded_account(&self, account: AccountInfo) -> Result<(), PortError> {
        if let NodeMode::Recording(state) = &self.mode {
            lock(state)?.account = account;
        }
        Ok(())
    }

    pub fn recorded(&self) -> Vec<RecordedBroadcast> {
        match &self.mode {
            NodeMode::Recording(state) => lock(state).map(|s| s.sent.clone()).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    pub async fn fetch_account(&self, address: &StacksAddress) -> Result<AccountInfo, PortError> {
        let http = match &self.mode {
            NodeMode::Http(http) => http,
            NodeMode::Recording(state) => return Ok(lock(state)?.account),
            NodeMode::Disabled(reason) => return Err(PortError::Policy(reason.clone())),
        };
        let url = format!("{}/v2/accounts/{address}?proof=0", http.base_url);
        let response = http
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PortError::Transport(format!("account request failed: {e}")))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(PortError::NotFound(format!("account {address}")));
        }
        if !status.is_success() {
            return Err(PortError::Transport(format!("account request status {status}")));
        }
        let body: AccountResponse = response
            .json()
            .await
            .map_err(|e| PortError::Transport(format!("account json decode failed: {e}")))?;
        let balance = parse_hex_balance(&body.balance)?;
        debug!(%address, balance, nonce = body.nonce, "fetched account");
        Ok(AccountInfo {
            balance,
            nonce: body.nonce,
        })
    }

    /// Current transfer fee rate in µSTX per byte.
    pub async fn fetch_fee_rate(&self) -> Result<u64, PortError> {
        let http = match &self.mode {
            NodeMode::Http(http) => http,
            NodeMode::Recording(_) => {
                return Err(PortError::NotImplemented("recording node has no fee rate"))
            }
            NodeMode::Disabled(reason) => return Err(PortError::Policy(reason.clone())),
        };
        let response = http
            .client
            .get(format!("{}/v2/fees/transfer", http.base_url))
            .send()
            .await
            .map_err(|e| PortError::Transport(format!("fee rate request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PortError::Transport(format!("fee rate request status {status}")));
        }
        response
            .json::<u64>()
            .await
            .map_err(|e| PortError::Transport(format!("fee rate json decode failed: {e}")))
    }

    async fn post_transaction(&self, bytes: Vec<u8>, local_txid: &str) -> Result<String, PortError> {
        let http = match &self.mode {
            NodeMode::Http(http) => http,
            NodeMode::Recording(state) => {
                lock(state)?.sent.push(RecordedBroadcast {
                    txid: local_txid.to_owned(),
                    bytes,
                });
                return Ok(local_txid.to_owned());
            }
            NodeMode::Disabled(reason) => return Err(PortError::Policy(reason.clone())),
        };
        let response = http
            .client
            .post(format!("{}/v2/transactions", http.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| PortError::Transport(format!("broadcast request failed: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PortError::Transport(format!("broadcast response read failed: {e}")))?;
        if !status.is_success() {
            // Proxies in front of the node answer with plain text.
            let message = match serde_json::from_str::<Value>(&text) {
                Ok(body) => rejection_message(status, &body),
                Err(_) if text.trim().is_empty() => {
                    format!("node rejected transaction ({status}): empty response")
                }
                Err(_) => format!("node rejected transaction ({status}): {}", text.trim()),
            };
            return Err(PortError::Transport(message));
        }
        let body: Value = serde_json::from_str(&text)
            .map_err(|e| PortError::Transport(format!("broadcast json decode failed: {e}")))?;
        let txid = body
            .as_str()
            .ok_or_else(|| PortError::Transport(format!("unexpected broadcast response: {body}")))?;
        Ok(normalize_txid(txid))
    }
}

impl BroadcastPort for NodeClient {
    async fn broadcast(
        &self,
        tx: SignedTransaction,
        amount: u64,
    ) -> Result<BroadcastReceipt, PortError> {
        let local_txid = tx.transaction().txid_hex();
        let fee = tx.transaction().fee();
        let txid = self.post_transaction(tx.serialize(), &local_txid).await?;
        if txid != local_txid {
            warn!(node = %txid, local = %local_txid, "node reported a different txid");
        }
        Ok(BroadcastReceipt {
            txid,
            amount,
            fee,
            total: amount.saturating_add(fee),
        })
    }
}

fn lock(state: &Mutex<RecordingState>) -> Result<std::sync::MutexGuard<'_, RecordingState>, PortError> {
    state
        .lock()
        .map_err(|e| PortError::Transport(format!("recording node lock poisoned: {e}")))
}

fn normalize_txid(txid: &str) -> String {
    let bare = txid.trim().trim_start_matches("0x");
    format!("0x{}", bare.to_ascii_lowercase())
}

fn rejection_message(status: reqwest::StatusCode, body: &Value) -> String {
    let error = body.get("error").and_then(Value::as_str).unwrap_or("rejected");
    match body.get("reason").and_then(Value::as_str) {
        Some(reason) => format!("node rejected transaction ({status}): {error}: {reason}"),
        None => format!("node rejected transaction ({status}): {error}"),
    }
}

fn parse_hex_balance(raw: &str) -> Result<u64, PortError> {
    let digits = raw.trim().trim_start_matches("0x");
    let value = u128::from_str_radix(digits, 16)
        .map_err(|e| PortError::Transport(format!("invalid balance {raw}: {e}")))?;
    u64::try_from(value).map_err(|_| PortError::Transport(format!("balance {raw} exceeds u64")))
}
