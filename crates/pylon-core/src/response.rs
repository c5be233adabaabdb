//! Result envelope returned by every service call.

use crate::{Result, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome code of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseCode {
    #[serde(rename = "0")]
    Ok,
    #[serde(rename = "-1")]
    Error,
    #[serde(rename = "-2")]
    AuthError,
}

/// Response written back for every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub code: ResponseCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Default for Response {
    fn default() -> Self {
        Self::ok()
    }
}

impl Response {
    /// Success with no data.
    pub fn ok() -> Self {
        Self {
            code: ResponseCode::Ok,
            message: None,
            data: None,
        }
    }

    /// Success carrying `data`.
    pub fn ok_with(data: impl Into<Value>) -> Self {
        Self {
            data: Some(data.into()),
            ..Self::ok()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: ResponseCode::Error,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn auth_error(message: impl Into<String>) -> Self {
        Self {
            code: ResponseCode::AuthError,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == ResponseCode::Ok
    }

    /// Convert into the data on success, or the matching error.
    pub fn into_result(self) -> Result<Option<Value>> {
        let message = self.message.unwrap_or_default();
        match self.code {
            ResponseCode::Ok => Ok(self.data),
            ResponseCode::Error => Err(RpcError::Handler { message }),
            ResponseCode::AuthError => Err(RpcError::Auth { message }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_codes_serialize_as_numeric_strings() {
        let json = serde_json::to_string(&Response::error("boom")).unwrap();
        assert!(json.contains("\"code\":\"-1\""));
        assert!(json.contains("\"message\":\"boom\""));
        assert!(!json.contains("\"data\""));

        let json = serde_json::to_string(&Response::auth_error("denied")).unwrap();
        assert!(json.contains("\"-2\""));
    }

    #[test]
    fn test_missing_optional_fields_deserialize() {
        let response: Response = serde_json::from_str(r#"{"code":"0"}"#).unwrap();
        assert!(response.is_success());
        assert!(response.message.is_none());
        assert!(response.data.is_none());
    }

    #[test]
    fn test_into_result() {
        assert_eq!(
            Response::ok_with("hi").into_result().unwrap(),
            Some(json!("hi"))
        );
        assert!(matches!(
            Response::error("boom").into_result(),
            Err(RpcError::Handler { message }) if message == "boom"
        ));
        assert!(matches!(
            Response::auth_error("denied").into_result(),
            Err(RpcError::Auth { .. })
        ));
    }
}
