use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// HTTP-shaped request envelope carried over the queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
}

/// Response envelope: HTTP status plus either data or an error message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            status: 200,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.status >= 400
    }
}

/// Wire frame around a request: correlation id, target pattern, reply queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RequestFrame {
    pub id: String,
    pub pattern: String,
    pub reply_to: String,
    pub request: RpcRequest,
}

/// Wire frame around a response, echoing the correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ResponseFrame {
    pub id: String,
    pub response: RpcResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_names_are_camel_case() {
        let frame = RequestFrame {
            id: "abc".into(),
            pattern: "auth.login".into(),
            reply_to: "beacon:rpc:reply:abc".into(),
            request: RpcRequest {
                method: "POST".into(),
                path: "/login".into(),
                ..Default::default()
            },
        };

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"replyTo\""));
        assert!(json.contains("\"pattern\":\"auth.login\""));
    }

    #[test]
    fn response_error_detection() {
        assert!(RpcResponse::error(500, "boom").is_error());
        assert!(RpcResponse {
            status: 404,
            data: None,
            error: None
        }
        .is_error());
        assert!(!RpcResponse::ok(serde_json::json!({"ok": true})).is_error());
    }
}
