//! JSON-RPC chain source
//!
//! Talks to a Bitcoin-Cash style full node (`getblockchaininfo`,
//! `getblockhash`, `getblock`, `getrawtransaction`). The node must report
//! legacy addresses so payments can be matched against token addresses.

use crate::{
    source::{ChainError, ChainSource},
    types::{BlockHeader, ChainStatus, RawInput, RawOutput, RawTransaction},
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use jsonrpsee::{
    core::{client::ClientT, params::BatchRequestBuilder},
    http_client::{HttpClient, HttpClientBuilder},
    rpc_params,
};
use orbit_protocol::SATS_PER_COIN;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Default request timeout; large blocks take a while on pruned nodes
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 480;

const MAX_RESPONSE_BYTES: u32 = 256 * 1024 * 1024;

// ============ Wire Types ============

#[derive(Debug, Deserialize)]
struct BlockchainInfo {
    blocks: u64,
    headers: u64,
    #[serde(default)]
    pruned: bool,
    #[serde(default)]
    pruneheight: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
    hash: String,
    height: u64,
    tx: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RpcScriptSig {
    hex: String,
}

#[derive(Debug, Deserialize)]
struct RpcVin {
    #[serde(default)]
    txid: Option<String>,
    #[serde(rename = "scriptSig", default)]
    script_sig: Option<RpcScriptSig>,
}

#[derive(Debug, Deserialize)]
struct RpcScriptPubKey {
    hex: String,
    #[serde(rename = "type")]
    script_type: String,
    #[serde(default)]
    addresses: Option<Vec<String>>,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcVout {
    value: f64,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: RpcScriptPubKey,
}

#[derive(Debug, Deserialize)]
struct RpcTransaction {
    txid: String,
    #[serde(default)]
    confirmations: u64,
    vin: Vec<RpcVin>,
    vout: Vec<RpcVout>,
}

/// Convert a coin amount to satoshis
pub fn coins_to_sats(value: f64) -> u64 {
    (value * SATS_PER_COIN as f64).round() as u64
}

impl From<RpcTransaction> for RawTransaction {
    fn from(tx: RpcTransaction) -> Self {
        let inputs = tx
            .vin
            .into_iter()
            .map(|vin| RawInput {
                txid: vin.txid,
                unlock_script: vin.script_sig.map(|s| s.hex),
            })
            .collect();

        let outputs = tx
            .vout
            .into_iter()
            .map(|vout| {
                let script = vout.script_pub_key;
                let addresses = script.addresses.or_else(|| script.address.map(|a| vec![a]));
                RawOutput {
                    value: coins_to_sats(vout.value),
                    script_type: script.script_type,
                    addresses,
                    script: script.hex,
                }
            })
            .collect();

        RawTransaction {
            txid: tx.txid,
            confirmations: tx.confirmations,
            inputs,
            outputs,
        }
    }
}

/// Split `user:password@` out of the URL into a basic-auth header
fn split_credentials(url: &str) -> Result<(String, HeaderMap), ChainError> {
    let mut parsed = Url::parse(url).map_err(|e| ChainError::InvalidUrl(e.to_string()))?;
    let mut headers = HeaderMap::new();

    if !parsed.username().is_empty() {
        let user = parsed.username().to_string();
        let password = parsed.password().unwrap_or_default().to_string();
        let token = BASE64.encode(format!("{}:{}", user, password));
        let value = HeaderValue::from_str(&format!("Basic {}", token))
            .map_err(|e| ChainError::InvalidUrl(e.to_string()))?;
        headers.insert(AUTHORIZATION, value);

        let strip = |_: ()| ChainError::InvalidUrl("cannot strip credentials".to_string());
        parsed.set_username("").map_err(strip)?;
        parsed.set_password(None).map_err(strip)?;
    }

    Ok((parsed.to_string(), headers))
}

/// Chain source backed by a full node's JSON-RPC interface
pub struct RpcChainSource {
    client: HttpClient,
    endpoint: String,
}

impl RpcChainSource {
    /// Connect to `url`, which may embed `user:password@` credentials
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ChainError> {
        let (endpoint, headers) = split_credentials(url)?;

        let client = HttpClientBuilder::default()
            .request_timeout(timeout)
            .max_response_size(MAX_RESPONSE_BYTES)
            .set_headers(headers)
            .build(&endpoint)
            .map_err(|e| ChainError::Transport(e.to_string()))?;

        tracing::debug!("RPC chain source at {}", endpoint);

        Ok(Self { client, endpoint })
    }

    /// Endpoint without credentials
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn rpc_error(method: &str, e: impl std::fmt::Display) -> ChainError {
    ChainError::Rpc {
        method: method.to_string(),
        message: e.to_string(),
    }
}

#[async_trait]
impl ChainSource for RpcChainSource {
    async fn chain_status(&self) -> Result<ChainStatus, ChainError> {
        let info: BlockchainInfo = self
            .client
            .request("getblockchaininfo", rpc_params![])
            .await
            .map_err(|e| rpc_error("getblockchaininfo", e))?;

        Ok(ChainStatus {
            best_height: info.blocks,
            header_height: info.headers,
            pruned: info.pruned,
            prune_height: info.pruneheight,
        })
    }

    async fn block_hash(&self, height: u64) -> Result<String, ChainError> {
        self.client
            .request("getblockhash", rpc_params![height])
            .await
            .map_err(|e| rpc_error("getblockhash", e))
    }

    async fn block(&self, hash: &str) -> Result<BlockHeader, ChainError> {
        let block: RpcBlock = self
            .client
            .request("getblock", rpc_params![hash])
            .await
            .map_err(|e| rpc_error("getblock", e))?;

        Ok(BlockHeader {
            hash: block.hash,
            height: block.height,
            transactions: block.tx,
        })
    }

    async fn raw_transactions(
        &self,
        txids: &[String],
        block_hint: Option<&str>,
    ) -> Result<Vec<RawTransaction>, ChainError> {
        if txids.is_empty() {
            return Ok(Vec::new());
        }

        let mut batch = BatchRequestBuilder::new();
        for txid in txids {
            let inserted = match block_hint {
                Some(hash) => batch.insert("getrawtransaction", rpc_params![txid, true, hash]),
                None => batch.insert("getrawtransaction", rpc_params![txid, true]),
            };
            inserted.map_err(|e| rpc_error("getrawtransaction", e))?;
        }

        let responses = self
            .client
            .batch_request::<RpcTransaction>(batch)
            .await
            .map_err(|e| rpc_error("getrawtransaction", e))?;

        let txs = responses
            .into_iter()
            .map(|entry| {
                entry
                    .map(RawTransaction::from)
                    .map_err(|e| rpc_error("getrawtransaction", e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if txs.len() != txids.len() {
            return Err(ChainError::Malformed(format!(
                "requested {} transactions, received {}",
                txids.len(),
                txs.len()
            )));
        }

        Ok(txs)
    }
}
