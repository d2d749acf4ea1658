//! HTTP JSON-RPC client backed by `reqwest`.
//!
//! Only the two calls the engine needs are implemented: `eth_blockNumber` and
//! `eth_getLogs`. There is no retry here; the fetcher's per-block fallback and
//! the head source's error budget handle transient failures.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use blockrelay_core::error::IngestError;
use blockrelay_core::types::{parse_hex_u64, to_hex_quantity, LogFilter, RawLog};

use crate::fetcher::EvmRpcClient;

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
            id,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn into_result(self) -> Result<Value, IngestError> {
        match self.error {
            Some(err) => Err(IngestError::Rpc(format!(
                "JSON-RPC error {}: {}",
                err.code, err.message
            ))),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Build the `eth_getLogs` filter object for `[from, to]`.
pub fn logs_params(from: u64, to: u64, filter: &LogFilter) -> Value {
    let mut params = json!({
        "fromBlock": to_hex_quantity(from),
        "toBlock": to_hex_quantity(to),
    });
    if !filter.addresses.is_empty() {
        params["address"] = json!(filter.addresses);
    }
    if !filter.topic0_values.is_empty() {
        params["topics"] = json!([filter.topic0_values]);
    }
    params
}

/// JSON-RPC over HTTP.
pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, IngestError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| IngestError::Config(format!("http client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, IngestError> {
        let req = JsonRpcRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, params);
        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| IngestError::Rpc(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(IngestError::Rpc(format!("HTTP {status}: {body}")));
        }

        resp.json::<JsonRpcResponse>()
            .await
            .map_err(|e| IngestError::Rpc(e.to_string()))?
            .into_result()
    }
}

#[async_trait]
impl EvmRpcClient for HttpRpcClient {
    async fn get_block_number(&self) -> Result<u64, IngestError> {
        let value = self.call("eth_blockNumber", vec![]).await?;
        value
            .as_str()
            .map(parse_hex_u64)
            .ok_or_else(|| IngestError::Rpc(format!("unexpected eth_blockNumber result: {value}")))
    }

    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<RawLog>, IngestError> {
        let value = self
            .call("eth_getLogs", vec![logs_params(from, to, filter)])
            .await?;
        serde_json::from_value(value).map_err(|e| IngestError::Rpc(format!("bad eth_getLogs result: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let req = JsonRpcRequest::new(7, "eth_blockNumber", vec![]);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":7"));
    }

    #[test]
    fn error_response_is_rpc_error() {
        let resp: JsonRpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32005, "message": "query returned more than 10000 results" }
        }))
        .unwrap();
        let err = resp.into_result().unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("-32005"));
    }

    #[test]
    fn get_logs_params() {
        let filter = LogFilter::default().topic0("0xddf2").topic0("0xaaaa");
        let p = logs_params(100, 149, &filter);
        assert_eq!(p["fromBlock"], "0x64");
        assert_eq!(p["toBlock"], "0x95");
        assert_eq!(p["topics"][0][1], "0xaaaa");
        assert!(p.get("address").is_none());
    }
}
