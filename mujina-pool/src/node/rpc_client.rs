//! HTTP JSON-RPC client for the node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::{Captures, Regex};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{BlockInfo, NodeRpc, RpcError};
use crate::error::Result;
use crate::job::BlockTemplate;
use crate::tracing::prelude::*;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Some daemons print `-nan` for undefined floats, which is not JSON.
///
/// String literals are matched too, so that text inside them is skipped;
/// only a `-nan` in value position has the `end` group.
static NAN_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:[^"\\]|\\.)*"|:\s*-nan(?P<end>\s*[,}\]])"#).expect("static regex")
});

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// Node client over HTTP with basic auth.
#[derive(Debug)]
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    user: String,
    password: String,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: &str, user: &str, password: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(RpcError::Transport)?;

        Ok(Self {
            http,
            url: url.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            next_id: AtomicU64::new(0),
        })
    }

    /// Make a JSON-RPC call and return its `result`.
    pub async fn call(&self, method: &str, params: Value) -> std::result::Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({ "method": method, "params": params, "id": id });
        trace!(%method, id, "Node request");

        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            error!(url = %self.url, "Node rejected username and/or password");
            return Err(RpcError::Unauthorized);
        }

        let body = response.text().await?;
        parse_response(status, &body)
    }
}

/// Interpret a node response body.
///
/// Nodes report RPC errors with a non-2xx status and a normal envelope, so
/// the envelope is read first and the status only matters if it is absent.
fn parse_response(status: StatusCode, body: &str) -> std::result::Result<Value, RpcError> {
    let envelope = match parse_envelope(body) {
        Ok(envelope) => envelope,
        Err(_) if !status.is_success() => return Err(RpcError::Status(status.as_u16())),
        Err(e) => return Err(RpcError::Parse(e)),
    };

    if let Some(error) = envelope.error.filter(|e| !e.is_null()) {
        return Err(RpcError::Rpc(error));
    }
    if !status.is_success() {
        return Err(RpcError::Status(status.as_u16()));
    }
    envelope.result.ok_or(RpcError::MissingResult)
}

fn parse_envelope(body: &str) -> serde_json::Result<Envelope> {
    let e = match serde_json::from_str(body) {
        Ok(envelope) => return Ok(envelope),
        Err(e) => e,
    };
    let repaired = repair_nan(body);
    if repaired == body {
        return Err(e);
    }
    debug!(error = %e, "Repairing -nan in node response");
    serde_json::from_str(&repaired)
}

/// Replace each `-nan` value with 0, leaving string contents untouched.
fn repair_nan(body: &str) -> String {
    NAN_VALUE
        .replace_all(body, |caps: &Captures<'_>| match caps.name("end") {
            Some(end) => format!(":0{}", end.as_str()),
            None => caps[0].to_string(),
        })
        .into_owned()
}

#[async_trait]
impl NodeRpc for RpcClient {
    async fn get_block_template(&self) -> Result<BlockTemplate> {
        let params = json!([{
            "capabilities": ["coinbasetxn", "workid", "coinbase/append"],
            "rules": ["segwit"]
        }]);
        let result = self.call("getblocktemplate", params).await?;
        BlockTemplate::from_json(result)
    }

    async fn submit_block(&self, block_hex: &str) -> Result<()> {
        // `submitblock` answers null on success and a reason string
        // otherwise, and a missing result is a success here.
        match self.call("submitblock", json!([block_hex])).await {
            Ok(Value::Null) | Err(RpcError::MissingResult) => Ok(()),
            Ok(reason) => {
                let reason = reason.as_str().map(str::to_string).unwrap_or_else(|| reason.to_string());
                Err(RpcError::Rejected(reason).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_block(&self, block_id: &str) -> Result<BlockInfo> {
        let result = self.call("getblock", json!([block_id])).await?;
        Ok(serde_json::from_value(result).map_err(RpcError::Parse)?)
    }

    async fn validate_address(&self, address: &str) -> Result<bool> {
        let result = self.call("validateaddress", json!([address])).await?;
        Ok(result
            .get("isvalid")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }
}
