use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 error codes.
pub(crate) const PARSE_ERROR: i64 = -32700;
pub(crate) const INVALID_REQUEST: i64 = -32600;
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;
pub(crate) const INVALID_PARAMS: i64 = -32602;
pub(crate) const INTERNAL_ERROR: i64 = -32603;
/// Method received before `initialize`.
pub(crate) const SERVER_NOT_INITIALIZED: i64 = -32002;

/// The protocol revision this server speaks.
pub(crate) const PROTOCOL_VERSION: &str = "2024-11-05";

/// An incoming JSON-RPC 2.0 message. A missing `id` marks a notification.
#[derive(Debug, Deserialize)]
pub(crate) struct Request {
    #[serde(default)]
    pub(crate) jsonrpc: Option<String>,
    #[serde(default)]
    pub(crate) id: Option<Value>,
    #[serde(default)]
    pub(crate) method: Option<String>,
    #[serde(default)]
    pub(crate) params: Option<Value>,
}

impl Request {
    /// Structural validity: version tag present and correct, method present.
    pub(crate) fn is_well_formed(&self) -> bool {
        self.jsonrpc.as_deref() == Some("2.0") && self.method.is_some()
    }

    pub(crate) fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Response {
    jsonrpc: &'static str,
    /// Echoed from the request; `null` when the request id was unreadable.
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorObject>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorObject {
    pub(crate) code: i64,
    pub(crate) message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) data: Option<Value>,
}

impl Response {
    pub(crate) fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub(crate) fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self::error_with_data(id, code, message, None)
    }

    pub(crate) fn error_with_data(
        id: Value,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(ErrorObject {
                code,
                message: message.into(),
                data,
            }),
        }
    }

    /// Serialize to a single line, ready for newline-delimited framing.
    pub(crate) fn to_line(&self) -> String {
        serde_json::to_string(self).expect("responses always serialize")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn request_shape_checks() {
        let ok: Request =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#).unwrap();
        assert!(ok.is_well_formed());
        assert!(!ok.is_notification());

        let notification: Request =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .unwrap();
        assert!(notification.is_well_formed());
        assert!(notification.is_notification());

        let wrong_version: Request =
            serde_json::from_str(r#"{"jsonrpc":"1.0","id":1,"method":"x"}"#).unwrap();
        assert!(!wrong_version.is_well_formed());

        let no_method: Request = serde_json::from_str(r#"{"jsonrpc":"2.0","id":1}"#).unwrap();
        assert!(!no_method.is_well_formed());
    }

    #[test]
    fn responses_are_single_json_lines() {
        let response = Response::success(json!(7), json!({"ok": true}));
        let line = response.to_line();
        assert!(!line.contains('\n'));
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["jsonrpc"], "2.0");
        assert_eq!(parsed["id"], 7);
        assert_eq!(parsed["result"]["ok"], true);

        let error = Response::error_with_data(
            json!("abc"),
            INVALID_PARAMS,
            "bad arguments",
            Some(json!({"required_level": "full"})),
        );
        let parsed: Value = serde_json::from_str(&error.to_line()).unwrap();
        assert_eq!(parsed["id"], "abc");
        assert_eq!(parsed["error"]["code"], INVALID_PARAMS);
        assert_eq!(parsed["error"]["data"]["required_level"], "full");
        assert!(parsed.get("result").is_none());
    }
}
