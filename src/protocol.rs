use crate::error::{Result, SnapError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// JSON-RPC protocol version sent with every request
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC request structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: u64,
    pub method: Method,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// `None` when the server could not determine the request id
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    #[serde(default = "default_error_code")]
    pub code: i64,
    #[serde(default = "default_error_message")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn default_error_code() -> i64 {
    -1
}

fn default_error_message() -> String {
    "Unknown error".to_string()
}

/// Server-initiated message without an id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// A decoded incoming message
#[derive(Debug, Clone)]
pub enum Incoming {
    Response(Response),
    Notification(Notification),
}

/// Request methods understood by snapserver
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Method {
    #[serde(rename = "Server.GetStatus")]
    ServerGetStatus,
    #[serde(rename = "Server.GetRPCVersion")]
    ServerGetRpcVersion,
    #[serde(rename = "Client.SetVolume")]
    ClientSetVolume,
    #[serde(rename = "Client.SetLatency")]
    ClientSetLatency,
    #[serde(rename = "Client.SetName")]
    ClientSetName,
    #[serde(rename = "Client.GetTimeStats")]
    ClientGetTimeStats,
    #[serde(rename = "Group.SetMute")]
    GroupSetMute,
    #[serde(rename = "Group.SetStream")]
    GroupSetStream,
    #[serde(rename = "Group.SetName")]
    GroupSetName,
    #[serde(rename = "Group.SetClients")]
    GroupSetClients,
}

impl Method {
    /// Wire name of the method
    pub fn as_str(self) -> &'static str {
        match self {
            Method::ServerGetStatus => "Server.GetStatus",
            Method::ServerGetRpcVersion => "Server.GetRPCVersion",
            Method::ClientSetVolume => "Client.SetVolume",
            Method::ClientSetLatency => "Client.SetLatency",
            Method::ClientSetName => "Client.SetName",
            Method::ClientGetTimeStats => "Client.GetTimeStats",
            Method::GroupSetMute => "Group.SetMute",
            Method::GroupSetStream => "Group.SetStream",
            Method::GroupSetName => "Group.SetName",
            Method::GroupSetClients => "Group.SetClients",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Request {
    /// Create a new request with the given id and method
    pub fn new(id: u64, method: Method) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method,
            params: None,
        }
    }

    /// Set the request params
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

impl Response {
    /// Turn the response into the `result` payload or a typed RPC error
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(err) => Err(SnapError::Rpc {
                code: err.code,
                message: err.message,
                data: err.data,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

impl Incoming {
    /// Classify a decoded JSON value as a response or a notification
    ///
    /// Anything with a non-null `id` is a response. Anything else carrying a
    /// `method` is a notification.
    pub fn from_value(value: Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| SnapError::Protocol("message is not a JSON object".to_string()))?;

        let has_id = obj.get("id").is_some_and(|id| !id.is_null());
        if !has_id && obj.contains_key("method") {
            let notification: Notification = serde_json::from_value(value)
                .map_err(|e| SnapError::Protocol(format!("bad notification: {}", e)))?;
            return Ok(Incoming::Notification(notification));
        }

        if obj.contains_key("result") || obj.contains_key("error") {
            let response: Response = serde_json::from_value(value)
                .map_err(|e| SnapError::Protocol(format!("bad response: {}", e)))?;
            return Ok(Incoming::Response(response));
        }

        Err(SnapError::Protocol(
            "message is neither a response nor a notification".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_wire_method_name() {
        let request = Request::new(7, Method::GroupSetStream)
            .with_params(json!({ "id": "g1", "stream_id": "radio" }));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "Group.SetStream",
                "params": { "id": "g1", "stream_id": "radio" }
            })
        );
    }

    #[test]
    fn request_without_params_omits_field() {
        let value = serde_json::to_value(Request::new(1, Method::ServerGetStatus)).unwrap();
        assert!(value.get("params").is_none());
        assert_eq!(value["method"], "Server.GetStatus");
    }

    #[test]
    fn method_display_matches_serde_name() {
        for method in [
            Method::ServerGetStatus,
            Method::ServerGetRpcVersion,
            Method::ClientSetVolume,
            Method::ClientSetLatency,
            Method::ClientSetName,
            Method::ClientGetTimeStats,
            Method::GroupSetMute,
            Method::GroupSetStream,
            Method::GroupSetName,
            Method::GroupSetClients,
        ] {
            let serialized = serde_json::to_value(method).unwrap();
            assert_eq!(serialized, json!(method.to_string()));
        }
    }

    #[test]
    fn classifies_notification() {
        let msg = Incoming::from_value(json!({
            "jsonrpc": "2.0",
            "method": "Client.OnNameChanged",
            "params": { "id": "c1", "name": "Kitchen" }
        }))
        .unwrap();
        match msg {
            Incoming::Notification(n) => assert_eq!(n.method, "Client.OnNameChanged"),
            other => panic!("expected notification, got {:?}", other),
        }
    }

    #[test]
    fn classifies_error_response() {
        let msg = Incoming::from_value(json!({
            "id": 3,
            "error": { "code": -32602, "message": "Invalid params" }
        }))
        .unwrap();
        let Incoming::Response(response) = msg else {
            panic!("expected response");
        };
        assert_eq!(response.id, Some(3));
        let err = response.into_result().unwrap_err();
        assert!(matches!(err, SnapError::Rpc { code: -32602, .. }));
    }

    #[test]
    fn rejects_non_object_and_shapeless_messages() {
        assert!(matches!(
            Incoming::from_value(json!([1, 2, 3])),
            Err(SnapError::Protocol(_))
        ));
        assert!(matches!(
            Incoming::from_value(json!({ "id": 4 })),
            Err(SnapError::Protocol(_))
        ));
    }
}
