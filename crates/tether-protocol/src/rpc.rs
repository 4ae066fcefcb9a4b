//! JSON-RPC message types for the runtime subprocess boundary.
//!
//! The runtime speaks newline-delimited JSON-RPC-shaped objects over
//! stdin/stdout. No `"jsonrpc"` version tag is required; messages are
//! classified purely by shape:
//!
//! - `id` + `method`: a request (either direction)
//! - `method` without `id`: a notification
//! - `id` + `result` or `error`, no `method`: the answer to an earlier request

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Distinguished JSON-RPC error codes.
pub mod error_codes {
    /// Transient "overloaded" condition. The gateway retries these.
    pub const OVERLOADED: i64 = -32001;
    /// Standard "invalid request".
    pub const INVALID_REQUEST: i64 = -32600;
    /// Standard "method not found". Returned for unsupported server-initiated
    /// methods so the runtime is never left waiting on an answer.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Standard "invalid params".
    pub const INVALID_PARAMS: i64 = -32602;
}

/// A request id. Opaque on the wire: the runtime may use numbers or strings,
/// and answers must correlate with whichever form the requester sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Canonical string form, used as the correlation key for pending
    /// requests and as the externally exposed approval request id.
    pub fn as_key(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::String(s) => s.clone(),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// A well-formed error response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("method not found: {}", method),
        )
    }

    /// Whether this error is the transient overloaded condition.
    pub fn is_overloaded(&self) -> bool {
        self.code == error_codes::OVERLOADED
    }
}

/// One message on the runtime connection, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    /// A request expecting a response (ours or the runtime's).
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    /// A fire-and-forget notification.
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// A successful response to an earlier request.
    Response { id: RequestId, result: Value },
    /// An error response to an earlier request.
    Error { id: RequestId, error: RpcError },
}

/// Why an inbound line could not be classified.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a json object")]
    NotAnObject,
    #[error("message id is neither a number nor a string")]
    BadId,
    #[error("unrecognized message shape")]
    UnrecognizedShape,
}

impl RpcMessage {
    /// Parse and classify one newline-delimited message.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(line)?;
        Self::classify(value)
    }

    /// Classify a decoded JSON value by shape.
    pub fn classify(value: Value) -> Result<Self, ParseError> {
        let Value::Object(mut obj) = value else {
            return Err(ParseError::NotAnObject);
        };

        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => match n.as_i64() {
                Some(n) => Some(RequestId::Number(n)),
                None => return Err(ParseError::BadId),
            },
            Some(Value::String(s)) => Some(RequestId::String(s)),
            Some(_) => return Err(ParseError::BadId),
        };
        let method = match obj.remove("method") {
            Some(Value::String(m)) => Some(m),
            _ => None,
        };

        match (id, method) {
            (Some(id), Some(method)) => Ok(Self::Request {
                id,
                method,
                params: obj.remove("params"),
            }),
            (None, Some(method)) => Ok(Self::Notification {
                method,
                params: obj.remove("params"),
            }),
            (Some(id), None) => {
                if let Some(error) = obj.remove("error") {
                    let error: RpcError =
                        serde_json::from_value(error).map_err(ParseError::Json)?;
                    Ok(Self::Error { id, error })
                } else if let Some(result) = obj.remove("result") {
                    Ok(Self::Response { id, result })
                } else {
                    Err(ParseError::UnrecognizedShape)
                }
            }
            (None, None) => Err(ParseError::UnrecognizedShape),
        }
    }

    /// Encode as a single JSON line (without the trailing newline).
    pub fn to_json_line(&self) -> String {
        let value = match self {
            Self::Request { id, method, params } => match params {
                Some(params) => json!({ "id": id, "method": method, "params": params }),
                None => json!({ "id": id, "method": method }),
            },
            Self::Notification { method, params } => match params {
                Some(params) => json!({ "method": method, "params": params }),
                None => json!({ "method": method }),
            },
            Self::Response { id, result } => json!({ "id": id, "result": result }),
            Self::Error { id, error } => json!({ "id": id, "error": error }),
        };
        value.to_string()
    }
}
