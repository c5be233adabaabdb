//! The wire unit exchanged between peers.

use crate::response::Response;
use crate::{Result, RpcError};
use bytes::Bytes;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Decoded request payload handed to service handlers.
pub type Payload = Map<String, Value>;

/// A single framed message.
///
/// Requests and their responses share `request_id` and `kind`; the
/// `is_response` flag alone tells them apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub request_id: String,
    pub kind: String,
    pub payload: Bytes,
    pub is_response: bool,
}

impl Message {
    /// Build an outgoing request with a fresh request id.
    pub fn request(kind: impl Into<String>, payload: &Payload) -> Result<Self> {
        Ok(Self {
            request_id: next_request_id(),
            kind: kind.into(),
            payload: Bytes::from(serde_json::to_vec(payload)?),
            is_response: false,
        })
    }

    /// Build the response to `self`, correlated by request id.
    pub fn respond(&self, response: &Response) -> Result<Self> {
        Ok(Self {
            request_id: self.request_id.clone(),
            kind: self.kind.clone(),
            payload: Bytes::from(serde_json::to_vec(response)?),
            is_response: true,
        })
    }

    /// Decode a request payload. An empty payload is an empty map.
    pub fn payload_map(&self) -> Result<Payload> {
        if self.payload.is_empty() {
            return Ok(Payload::new());
        }
        serde_json::from_slice(&self.payload).map_err(RpcError::from)
    }

    /// Decode a response payload.
    pub fn response(&self) -> Result<Response> {
        serde_json::from_slice(&self.payload).map_err(|e| RpcError::Decode {
            message: e.to_string(),
        })
    }
}

/// Generate a request id, unique for the lifetime of the process.
pub fn next_request_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_keeps_kind_and_request_id() {
        let mut payload = Payload::new();
        payload.insert("cmd".into(), json!("echo hi"));
        let request = Message::request("execute_response", &payload).unwrap();
        let reply = request.respond(&Response::ok()).unwrap();

        assert_eq!(reply.request_id, request.request_id);
        assert_eq!(reply.kind, "execute_response");
        assert!(reply.is_response);
        assert!(!request.is_response);
    }

    #[test]
    fn test_payload_map_decodes_request() {
        let mut payload = Payload::new();
        payload.insert("name".into(), json!("agent1"));
        let request = Message::request("ping", &payload).unwrap();

        assert_eq!(request.payload_map().unwrap()["name"], json!("agent1"));
    }

    #[test]
    fn test_empty_payload_is_empty_map() {
        let message = Message {
            request_id: "1".into(),
            kind: "ping".into(),
            payload: Bytes::new(),
            is_response: false,
        };
        assert!(message.payload_map().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_response_is_decode_error() {
        let message = Message {
            request_id: "1".into(),
            kind: "ping".into(),
            payload: Bytes::from_static(b"{not json"),
            is_response: true,
        };
        assert!(matches!(message.response(), Err(RpcError::Decode { .. })));
    }

    #[test]
    fn test_request_ids_are_unique() {
        let ids: std::collections::HashSet<String> =
            (0..1000).map(|_| next_request_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
