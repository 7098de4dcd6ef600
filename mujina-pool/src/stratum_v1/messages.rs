//! Stratum v1 message types and JSON-RPC serialization.
//!
//! Messages follow the JSON-RPC shape with Stratum's conventions: no version
//! field, notifications carry `"id": null`, and errors are the three-element
//! `[code, message, null]` array. Responses always carry both `result` and
//! `error`, one of them null, which is what mining software expects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{StratumError, StratumResult};
use crate::tracing::prelude::*;

pub const METHOD_SUBSCRIBE: &str = "mining.subscribe";
pub const METHOD_AUTHORIZE: &str = "mining.authorize";
pub const METHOD_SUBMIT: &str = "mining.submit";
pub const METHOD_EXTRANONCE_SUBSCRIBE: &str = "mining.extranonce.subscribe";
pub const METHOD_NOTIFY: &str = "mining.notify";
pub const METHOD_SET_DIFFICULTY: &str = "mining.set_difficulty";
pub const METHOD_SET_TARGET: &str = "mining.set_target";

/// JSON-RPC message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request or notification
    Request {
        /// Message ID (null for notifications)
        id: Option<u64>,
        /// Method name (e.g., "mining.notify", "mining.subscribe")
        method: String,
        /// Method parameters
        #[serde(default)]
        params: Value,
    },

    /// Response to a request
    Response {
        /// Message ID matching the request
        id: Option<u64>,
        /// Result value, null on failure
        result: Option<Value>,
        /// Error array, null on success
        error: Option<Value>,
    },
}

impl JsonRpcMessage {
    /// Create a notification (request without ID).
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: None,
            method: method.into(),
            params,
        }
    }

    /// Successful response.
    pub fn response(id: Option<u64>, result: Value) -> Self {
        JsonRpcMessage::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response with a `[code, message, null]` error.
    pub fn error_response(id: Option<u64>, error: Value) -> Self {
        JsonRpcMessage::Response {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Get the message ID if present.
    pub fn id(&self) -> Option<u64> {
        match self {
            JsonRpcMessage::Request { id, .. } => *id,
            JsonRpcMessage::Response { id, .. } => *id,
        }
    }

    /// Get the method name for requests.
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request { method, .. } => Some(method),
            JsonRpcMessage::Response { .. } => None,
        }
    }

    /// Get the params of a request, if it has any.
    pub fn params(&self) -> Option<&Value> {
        match self {
            JsonRpcMessage::Request { params, .. } => Some(params),
            JsonRpcMessage::Response { .. } => None,
        }
    }
}

/// A request from a miner, decoded by method.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Subscribe,

    /// `worker` is `None` when the first param is missing, empty or not a
    /// string.
    Authorize { worker: Option<String> },

    /// Raw params; their layout depends on the algorithm.
    Submit(Vec<Value>),

    ExtranonceSubscribe,

    Unknown(String),
}

impl ClientRequest {
    /// Decode a message read from a miner.
    ///
    /// Responses and requests whose params are not an array are malformed.
    pub fn from_message(msg: &JsonRpcMessage) -> StratumResult<(Option<u64>, Self)> {
        let JsonRpcMessage::Request { id, method, params } = msg else {
            return Err(StratumError::Malformed("expected a request".into()));
        };

        let params: &[Value] = match params {
            Value::Array(values) => values,
            Value::Null => &[],
            _ => {
                return Err(StratumError::Malformed(format!(
                    "{} params are not an array",
                    method
                )))
            }
        };

        let request = match method.as_str() {
            METHOD_SUBSCRIBE => ClientRequest::Subscribe,
            METHOD_AUTHORIZE => ClientRequest::Authorize {
                worker: params
                    .first()
                    .and_then(Value::as_str)
                    .filter(|w| !w.is_empty())
                    .map(str::to_string),
            },
            METHOD_SUBMIT => ClientRequest::Submit(params.to_vec()),
            METHOD_EXTRANONCE_SUBSCRIBE => ClientRequest::ExtranonceSubscribe,
            other => ClientRequest::Unknown(other.to_string()),
        };

        Ok((*id, request))
    }
}

/// Stratum's word-swapped encoding of a 32-byte hash.
///
/// The internal (little-endian) hash is treated as eight 32-bit words and
/// each word's bytes are reversed. Miners undo this before hashing.
pub fn word_swap_hex(hash_le: &[u8; 32]) -> String {
    let mut bytes = *hash_le;
    for chunk in bytes.chunks_mut(4) {
        chunk.reverse();
    }
    hex::encode(bytes)
}

/// Decode a hex string param, tolerating a `0x` prefix.
///
/// Text that is not hex decodes to no bytes, so the field fails its size
/// check and the share is rejected instead of the message. Every hex
/// field a share carries has a non-zero size.
pub fn hex_param(params: &[Value], index: usize, name: &str) -> StratumResult<Vec<u8>> {
    let s = str_param(params, index, name)?;
    let s = s.strip_prefix("0x").unwrap_or(s);
    Ok(hex::decode(s).unwrap_or_else(|e| {
        trace!(field = name, error = %e, "Undecodable hex param");
        Vec::new()
    }))
}

/// Fetch a string param.
pub fn str_param<'a>(params: &'a [Value], index: usize, name: &str) -> StratumResult<&'a str> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| StratumError::Malformed(format!("{} missing or not a string", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test]
    fn test_parse_subscribe() {
        let msg: JsonRpcMessage = serde_json::from_value(json!({
            "id": 1,
            "method": "mining.subscribe",
            "params": ["cgminer/4.10.0"]
        }))
        .unwrap();
        assert_eq!(
            ClientRequest::from_message(&msg).unwrap(),
            (Some(1), ClientRequest::Subscribe)
        );
    }

    #[test]
    fn test_parse_authorize() {
        let msg: JsonRpcMessage = serde_json::from_value(json!({
            "id": 2,
            "method": "mining.authorize",
            "params": ["addr.rig1", "x"]
        }))
        .unwrap();
        assert_eq!(
            ClientRequest::from_message(&msg).unwrap().1,
            ClientRequest::Authorize {
                worker: Some("addr.rig1".into())
            }
        );

        let empty: JsonRpcMessage = serde_json::from_value(json!({
            "id": 2,
            "method": "mining.authorize",
            "params": ["", "x"]
        }))
        .unwrap();
        assert_eq!(
            ClientRequest::from_message(&empty).unwrap().1,
            ClientRequest::Authorize { worker: None }
        );
    }

    #[test]
    fn test_non_array_params_are_malformed() {
        let msg: JsonRpcMessage = serde_json::from_value(json!({
            "id": 3,
            "method": "mining.submit",
            "params": { "worker": "w" }
        }))
        .unwrap();
        assert!(matches!(
            ClientRequest::from_message(&msg),
            Err(StratumError::Malformed(_))
        ));
    }

    #[test]
    fn test_response_from_miner_is_malformed() {
        let msg = JsonRpcMessage::response(Some(1), json!(true));
        assert!(ClientRequest::from_message(&msg).is_err());
    }

    #[test]
    fn test_unknown_method() {
        let msg: JsonRpcMessage = serde_json::from_value(json!({
            "id": null,
            "method": "mining.suggest_difficulty",
            "params": [1024]
        }))
        .unwrap();
        assert_eq!(
            ClientRequest::from_message(&msg).unwrap(),
            (None, ClientRequest::Unknown("mining.suggest_difficulty".into()))
        );
    }

    #[test]
    fn test_response_always_has_result_and_error() {
        let ok = serde_json::to_value(JsonRpcMessage::response(Some(4), json!(true))).unwrap();
        assert_eq!(ok, json!({ "id": 4, "result": true, "error": null }));

        let err = serde_json::to_value(JsonRpcMessage::error_response(
            Some(5),
            json!([21, "Stale share - Job not found", null]),
        ))
        .unwrap();
        assert_eq!(
            err,
            json!({ "id": 5, "result": null, "error": [21, "Stale share - Job not found", null] })
        );
    }

    #[test]
    fn test_notification_has_null_id() {
        let msg = JsonRpcMessage::notification(METHOD_SET_DIFFICULTY, json!([512]));
        let serialized = serde_json::to_string(&msg).unwrap();
        assert!(serialized.contains("\"id\":null"));
        assert_eq!(msg.method(), Some(METHOD_SET_DIFFICULTY));
    }

    #[test]
    fn test_word_swap() {
        // Inverse of the miner-side decoding: internal bytes
        // [fd 55 64 6b] [c1 62 b9 6d] ... become "6b6455fd" "6db962c1" ...
        let display = "000000000000000000015296bc96391d0d67f4a301f2d4fc6db962c16b6455fd";
        let mut internal: [u8; 32] = hex::decode(display).unwrap().try_into().unwrap();
        internal.reverse();
        assert_eq!(
            word_swap_hex(&internal),
            "6b6455fd6db962c101f2d4fc0d67f4a3bc96391d000152960000000000000000"
        );
    }

    #[test]
    fn test_hex_param() {
        let params = vec![json!("0x00ff"), json!(7), json!("zz")];
        assert_eq!(hex_param(&params, 0, "nonce").unwrap(), vec![0x00, 0xff]);
        assert!(hex_param(&params, 1, "nonce").is_err());
        assert!(hex_param(&params, 3, "nonce").is_err());
    }

    #[test_case("zz" ; "not hex")]
    #[test_case("0000001" ; "odd length")]
    #[test_case("0x" ; "bare prefix")]
    fn test_hex_param_undecodable_is_empty(text: &str) {
        let params = vec![json!(text)];
        assert_eq!(hex_param(&params, 0, "nonce").unwrap(), Vec::<u8>::new());
    }
}
