//! JSON-RPC block source for account chains.
//!
//! Calls are blocking `minreq` requests run on the blocking pool. Heights are
//! addressable, so this source also serves the multi-threaded range sync.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chainidx_adapter::NativeBlock;
use chainidx_params::{hash256_to_prefixed_hex, Hash256};
use chainidx_primitives::account::quantity;
use chainidx_primitives::AccountBlock;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::source::{Announcement, ChainSource, HeaderSummary, SourceError};

const HEADER_BATCH: u64 = 64;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Header-only view of `eth_getBlockBy*` with `false` for full transactions.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockStub {
    #[serde(with = "quantity")]
    number: u64,
    #[serde(with = "chainidx_primitives::account::hash")]
    hash: Hash256,
    #[serde(with = "chainidx_primitives::account::hash")]
    parent_hash: Hash256,
}

pub struct RpcChainSource {
    url: String,
    start_height: u64,
    timeout_secs: u64,
    last_announced: Mutex<u64>,
}

impl RpcChainSource {
    pub fn new(url: impl Into<String>, start_height: u64) -> Self {
        Self {
            url: url.into(),
            start_height,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            last_announced: Mutex::new(0),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    async fn call(&self, method: &'static str, params: Value) -> Result<Value, SourceError> {
        let url = self.url.clone();
        let timeout_secs = self.timeout_secs;
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        })
        .to_string();
        tokio::task::spawn_blocking(move || {
            let response = minreq::post(&url)
                .with_header("Content-Type", "application/json")
                .with_body(body)
                .with_timeout(timeout_secs)
                .send()
                .map_err(|err| SourceError::Rpc(format!("{method}: {err}")))?;
            if response.status_code != 200 {
                return Err(SourceError::Rpc(format!(
                    "{method}: HTTP {}",
                    response.status_code
                )));
            }
            let text = response
                .as_str()
                .map_err(|err| SourceError::Rpc(format!("{method}: {err}")))?;
            parse_response(method, text)
        })
        .await
        .map_err(|err| SourceError::Rpc(format!("{method}: {err}")))?
    }

    async fn stub_by_number(&self, height: u64) -> Result<Option<BlockStub>, SourceError> {
        let value = self
            .call("eth_getBlockByNumber", json!([format!("0x{height:x}"), false]))
            .await?;
        from_nullable(value)
    }

    async fn stub_by_hash(&self, hash: &Hash256) -> Result<Option<BlockStub>, SourceError> {
        let value = self
            .call("eth_getBlockByHash", json!([hash256_to_prefixed_hex(hash), false]))
            .await?;
        from_nullable(value)
    }

    async fn full_block(&self, params: Value, method: &'static str) -> Result<Option<AccountBlock>, SourceError> {
        let value = self.call(method, params).await?;
        from_nullable(value)
    }

    /// Height after which the source's canonical chain agrees with `locator`.
    async fn fork_point(&self, locator: &[Hash256]) -> Result<Option<u64>, SourceError> {
        for hash in locator {
            let Some(stub) = self.stub_by_hash(hash).await? else {
                continue;
            };
            let canonical = self.stub_by_number(stub.number).await?;
            if canonical.map(|block| block.hash) == Some(*hash) {
                return Ok(Some(stub.number));
            }
        }
        Ok(None)
    }
}

fn parse_response(method: &str, text: &str) -> Result<Value, SourceError> {
    let response: RpcResponse = serde_json::from_str(text)
        .map_err(|err| SourceError::Protocol(format!("{method}: {err}")))?;
    if let Some(error) = response.error {
        return Err(SourceError::Rpc(format!(
            "{method}: {} ({})",
            error.message, error.code
        )));
    }
    Ok(response.result)
}

fn from_nullable<T: for<'de> Deserialize<'de>>(value: Value) -> Result<Option<T>, SourceError> {
    if value.is_null() {
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|err| SourceError::Protocol(err.to_string()))
}

#[async_trait]
impl ChainSource for RpcChainSource {
    async fn remote_tip(&self) -> Result<u64, SourceError> {
        let value = self.call("eth_blockNumber", json!([])).await?;
        let raw = value
            .as_str()
            .ok_or_else(|| SourceError::Protocol("eth_blockNumber: expected a quantity".to_string()))?;
        quantity::parse(raw).map_err(SourceError::Protocol)
    }

    async fn headers_after(&self, locator: &[Hash256]) -> Result<Vec<HeaderSummary>, SourceError> {
        let start = if locator.is_empty() {
            self.start_height
        } else {
            match self.fork_point(locator).await? {
                Some(height) => height + 1,
                None => {
                    return Err(SourceError::Protocol(
                        "no locator hash is on the remote chain".to_string(),
                    ))
                }
            }
        };
        let tip = self.remote_tip().await?;
        let mut out = Vec::new();
        let mut height = start;
        while height <= tip && (out.len() as u64) < HEADER_BATCH {
            let Some(stub) = self.stub_by_number(height).await? else {
                break;
            };
            out.push(HeaderSummary {
                hash: stub.hash,
                previous_hash: stub.parent_hash,
                work: None,
            });
            height += 1;
        }
        Ok(out)
    }

    async fn fetch_blocks(&self, hashes: &[Hash256]) -> Result<Vec<NativeBlock>, SourceError> {
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let block = self
                .full_block(
                    json!([hash256_to_prefixed_hex(hash), true]),
                    "eth_getBlockByHash",
                )
                .await?
                .ok_or(SourceError::NotFound(*hash))?;
            out.push(NativeBlock::Account(block));
        }
        Ok(out)
    }

    async fn fetch_range(&self, start: u64, end: u64) -> Result<Vec<NativeBlock>, SourceError> {
        let mut out = Vec::new();
        for height in start..=end {
            let block = self
                .full_block(
                    json!([format!("0x{height:x}"), true]),
                    "eth_getBlockByNumber",
                )
                .await?
                .ok_or_else(|| SourceError::Protocol(format!("no block at height {height}")))?;
            out.push(NativeBlock::Account(block));
        }
        Ok(out)
    }

    async fn next_announcement(&self, wait: Duration) -> Result<Option<Announcement>, SourceError> {
        tokio::time::sleep(wait).await;
        let tip = self.remote_tip().await?;
        let Ok(mut last) = self.last_announced.lock() else {
            return Ok(Some(Announcement::Tip(tip)));
        };
        if tip > *last {
            *last = tip;
            return Ok(Some(Announcement::Tip(tip)));
        }
        Ok(None)
    }

    async fn report_suspect(&self, _reason: &str) {
        // A single endpoint has no alternative to switch to.
    }

    async fn broadcast(&self, raw: &[u8]) -> Result<Hash256, SourceError> {
        let value = self
            .call(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(raw))]),
            )
            .await?;
        let raw_hash = value
            .as_str()
            .ok_or_else(|| SourceError::Protocol("eth_sendRawTransaction: expected a hash".to_string()))?;
        chainidx_params::hash256_from_prefixed_hex(raw_hash)
            .map_err(|err| SourceError::Protocol(err.to_string()))
    }
}
