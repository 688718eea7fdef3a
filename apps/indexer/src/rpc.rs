use crate::chain::{BlockHeader, ChainClient};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-RPC client for the chain node. Several endpoints may be configured;
/// requests stick to the endpoint that last answered, so the scanner keeps
/// seeing a single node's view of the chain, and rotate onward only when
/// that endpoint fails.
pub struct RpcClient {
    endpoints: Vec<String>,
    http: reqwest::Client,
    request_id: AtomicU64,
    active_endpoint: AtomicUsize,
}

// `result` stays a plain Value: a node reports a missing block as
// `"result": null`, which must survive as Null rather than collapse into a
// missing field.
#[derive(Deserialize)]
struct RpcEnvelope {
    error: Option<Value>,
    #[serde(default)]
    result: Value,
}

impl RpcClient {
    pub fn new(endpoints: Vec<String>) -> Result<Self> {
        if endpoints.is_empty() {
            anyhow::bail!("at least one rpc endpoint is required");
        }
        let http = reqwest::ClientBuilder::new()
            .timeout(RPC_TIMEOUT)
            .build()
            .context("build http client")?;

        Ok(Self {
            endpoints,
            http,
            request_id: AtomicU64::new(1),
            active_endpoint: AtomicUsize::new(0),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.request_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let active = self.active_endpoint.load(Ordering::Relaxed) % self.endpoints.len();
        let mut failure: Option<anyhow::Error> = None;
        for offset in 0..self.endpoints.len() {
            let idx = (active + offset) % self.endpoints.len();
            match self.call_endpoint(&self.endpoints[idx], method, &body).await {
                Ok(result) => {
                    self.active_endpoint.store(idx, Ordering::Relaxed);
                    return Ok(result);
                }
                Err(e) => failure = Some(e),
            }
        }

        Err(failure
            .unwrap_or_else(|| anyhow::anyhow!("no rpc endpoints configured"))
            .context(format!("{method}: every rpc endpoint failed")))
    }

    async fn call_endpoint(&self, url: &str, method: &str, body: &Value) -> Result<Value> {
        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("{method}: send to {url}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .with_context(|| format!("{method}: read reply from {url}"))?;
        if !status.is_success() {
            anyhow::bail!("{method}: {url} replied http {}: {text}", status.as_u16());
        }

        let envelope: RpcEnvelope = serde_json::from_str(&text)
            .with_context(|| format!("{method}: malformed json-rpc reply from {url}"))?;
        if let Some(err) = envelope.error {
            anyhow::bail!("{method}: node error from {url}: {err}");
        }
        Ok(envelope.result)
    }
}

impl ChainClient for RpcClient {
    async fn latest_height(&self) -> Result<u64> {
        let v = self.call("eth_blockNumber", json!([])).await?;
        quantity_to_u64(&v).context("eth_blockNumber quantity")
    }

    async fn header_at(&self, block_number: u64) -> Result<Option<BlockHeader>> {
        let v = self
            .call(
                "eth_getBlockByNumber",
                json!([to_quantity(block_number), false]),
            )
            .await
            .with_context(|| format!("eth_getBlockByNumber({block_number})"))?;
        if v.is_null() {
            return Ok(None);
        }
        Ok(Some(parse_header(block_number, &v)?))
    }

    async fn logs_in_range(
        &self,
        from_block: u64,
        to_block: u64,
        address: &str,
    ) -> Result<Vec<alloy::rpc::types::Log>> {
        let filter = json!({
            "address": address,
            "fromBlock": to_quantity(from_block),
            "toBlock": to_quantity(to_block),
        });
        let v = self.call("eth_getLogs", json!([filter])).await.with_context(|| {
            format!("eth_getLogs(address={address}, from={from_block}, to={to_block})")
        })?;
        serde_json::from_value(v).context("eth_getLogs reply is not a log array")
    }
}

fn parse_header(block_number: u64, block: &Value) -> Result<BlockHeader> {
    Ok(BlockHeader {
        number: block_number,
        hash: parse_block_hash_field(block, "hash")?,
        parent_hash: parse_block_hash_field(block, "parentHash")?,
    })
}

fn parse_block_hash_field(block: &Value, field: &str) -> Result<String> {
    let h = block
        .get(field)
        .and_then(|v| v.as_str())
        .with_context(|| format!("missing block.{field}"))?;
    Ok(h.to_lowercase())
}

pub fn to_quantity(value: u64) -> String {
    format!("0x{value:x}")
}

/// Decodes a json-rpc "quantity" (0x-prefixed hex string; some nodes reply
/// with plain decimals or bare numbers).
pub fn quantity_to_u64(v: &Value) -> Result<u64> {
    if let Some(n) = v.as_u64() {
        return Ok(n);
    }
    let s = v
        .as_str()
        .with_context(|| format!("not a json-rpc quantity: {v}"))?
        .trim();
    match s.strip_prefix("0x") {
        Some(hex) if !hex.is_empty() => {
            u64::from_str_radix(hex, 16).with_context(|| format!("bad hex quantity: {s}"))
        }
        Some(_) => anyhow::bail!("bad hex quantity: {s}"),
        None => s
            .parse::<u64>()
            .with_context(|| format!("bad decimal quantity: {s}")),
    }
}

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "deadline",
    "too many requests",
    "rate limit",
    "429",
    "502",
    "503",
    "504",
    "bad gateway",
    "gateway",
    "service unavailable",
    "connection reset",
    "connection closed",
    "connection refused",
    "broken pipe",
    "temporarily unavailable",
];

/// Whether an error is worth a plain retry on the next tick, as opposed to
/// bad data or misconfiguration. Matches the whole context chain, since the
/// interesting marker usually sits in the innermost transport error.
pub fn is_transient(err: &anyhow::Error) -> bool {
    let chain = format!("{err:#}").to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| chain.contains(m))
}
