// src/anchor/rpc.rs
// Base-chain RPC collaborator and a bitcoind JSON-RPC client

use crate::error::RpcFailure;
use crate::ledger::Hash;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::time::Duration;

/// Block as returned by `getblock <hash> 2`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcBlock {
    pub hash: String,
    pub height: u64,
    #[serde(default)]
    pub tx: Vec<RpcTransaction>,
}

/// Verbose transaction (`getrawtransaction <txid> true`, or embedded in a verbose block).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcTransaction {
    pub txid: String,
    #[serde(default)]
    pub blockhash: Option<String>,
    #[serde(default)]
    pub vin: Vec<RpcInput>,
    #[serde(default)]
    pub vout: Vec<RpcOutput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcInput {
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub vout: Option<u32>,
    #[serde(default)]
    pub coinbase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcOutput {
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub asm: String,
    #[serde(default)]
    pub hex: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl ScriptPubKey {
    /// Provably unspendable data-carrier output.
    pub fn is_null_data(&self) -> bool {
        self.kind == "nulldata" || self.asm.starts_with("OP_RETURN")
    }
}

impl RpcTransaction {
    /// Whether the first input spends output `vout` of `txid`.
    pub fn spends(&self, txid: &str, vout: u32) -> bool {
        self.vin
            .first()
            .map(|i| i.txid.as_deref() == Some(txid) && i.vout == Some(vout))
            .unwrap_or(false)
    }

    /// 32-byte payload pushed by a null-data second output, if any.
    pub fn commitment(&self) -> Option<Hash> {
        let script = &self.vout.get(1)?.script_pub_key;
        if !script.is_null_data() {
            return None;
        }
        let data = script.asm.split_whitespace().nth(1)?;
        let mut out = [0u8; 32];
        match hex::decode_to_slice(data, &mut out) {
            Ok(()) => Some(out),
            Err(_) => {
                log::debug!(
                    "tx {}: null-data payload is not a 32-byte hash: {}",
                    self.txid,
                    data
                );
                None
            }
        }
    }
}

/// Request/response access to the base chain.
#[async_trait]
pub trait BaseChainRpc: Send + Sync {
    /// Height of the best known block.
    async fn get_chain_tip(&self) -> Result<u64, RpcFailure>;
    async fn get_block_by_height(&self, height: u64) -> Result<RpcBlock, RpcFailure>;
    async fn get_block_by_hash(&self, hash: &str) -> Result<RpcBlock, RpcFailure>;
    async fn get_raw_transaction_verbose(&self, txid: &str) -> Result<RpcTransaction, RpcFailure>;
}

#[derive(Debug, Deserialize)]
struct ChainTip {
    height: u64,
    #[serde(default)]
    status: String,
}

/// JSON-RPC client for bitcoind with HTTP basic auth.
pub struct BitcoindClient {
    client: Client,
    url: String,
    user: String,
    password: String,
    timeout: Duration,
}

impl BitcoindClient {
    pub fn new(host: &str, port: u16, user: &str, password: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            url: format!("http://{}:{}", host, port),
            user: user.to_string(),
            password: password.to_string(),
            timeout,
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: JsonValue,
    ) -> Result<T, RpcFailure> {
        let body = json!({"id": "0", "jsonrpc": "2.0", "method": method, "params": params});
        let resp = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcFailure::Timeout {
                        method: method.to_string(),
                        secs: self.timeout.as_secs(),
                    }
                } else {
                    RpcFailure::Transport {
                        method: method.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| RpcFailure::Transport {
            method: method.to_string(),
            reason: e.to_string(),
        })?;
        decode_response(method, status.as_u16(), &text)
    }
}

/// Interpret a JSON-RPC reply. bitcoind answers application errors with a 500 and a
/// JSON body, so an `error` member takes precedence over the status code.
fn decode_response<T: DeserializeOwned>(
    method: &str,
    status: u16,
    body: &str,
) -> Result<T, RpcFailure> {
    let parsed: JsonValue = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) if status >= 300 => {
            return Err(RpcFailure::Status {
                method: method.to_string(),
                status,
            })
        }
        Err(_) => {
            return Err(RpcFailure::InvalidJson {
                method: method.to_string(),
                body: body.chars().take(200).collect(),
            })
        }
    };

    if let Some(err) = parsed.get("error").filter(|e| !e.is_null()) {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(RpcFailure::Response {
            method: method.to_string(),
            message,
        });
    }
    if status >= 300 {
        return Err(RpcFailure::Status {
            method: method.to_string(),
            status,
        });
    }

    let result = parsed
        .get("result")
        .filter(|r| !r.is_null())
        .cloned()
        .ok_or_else(|| RpcFailure::Response {
            method: method.to_string(),
            message: "empty result".to_string(),
        })?;
    serde_json::from_value(result).map_err(|e| RpcFailure::UnexpectedShape {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl BaseChainRpc for BitcoindClient {
    async fn get_chain_tip(&self) -> Result<u64, RpcFailure> {
        let tips: Vec<ChainTip> = self.call("getchaintips", json!([])).await?;
        tips.iter()
            .find(|t| t.status == "active")
            .or_else(|| tips.first())
            .map(|t| t.height)
            .ok_or_else(|| RpcFailure::UnexpectedShape {
                method: "getchaintips".to_string(),
                reason: "no chain tips".to_string(),
            })
    }

    async fn get_block_by_height(&self, height: u64) -> Result<RpcBlock, RpcFailure> {
        let hash: String = self.call("getblockhash", json!([height])).await?;
        self.get_block_by_hash(&hash).await
    }

    async fn get_block_by_hash(&self, hash: &str) -> Result<RpcBlock, RpcFailure> {
        self.call("getblock", json!([hash, 2])).await
    }

    async fn get_raw_transaction_verbose(&self, txid: &str) -> Result<RpcTransaction, RpcFailure> {
        self.call("getrawtransaction", json!([txid, true])).await
    }
}
