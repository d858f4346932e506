// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire envelopes for service requests and responses.
//!
//! Envelopes are JSON documents; user payloads travel as opaque byte
//! sequences inside them. Transport-level delimiting (length prefix or the
//! legacy single-read contract) lives in [`frame`].
//!
//! Request: `{ header: { method_name, caller }, payload }`
//! Response: `{ header: { host_name, service_name, service_id, method_name,
//! error, state }, ret_state, payload }`

pub mod frame;

use crate::types::{CallState, HostIdentity, ServiceResponse};
use serde::{Deserialize, Serialize};

pub use frame::FrameError;

/// Header of a request envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Method to invoke
    pub method_name: String,
    /// Identity of the calling process
    pub caller: HostIdentity,
}

/// A framed service request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Request header
    pub header: RequestHeader,
    /// Opaque request payload
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// Header of a response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// Responding host
    pub host_name: String,
    /// Service name
    pub service_name: String,
    /// Responding service instance id
    pub service_id: String,
    /// Method that was invoked
    pub method_name: String,
    /// Error description, empty on success
    #[serde(default)]
    pub error: String,
    /// Whether the handler executed
    pub state: CallState,
}

/// A framed service response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Response header
    pub header: ResponseHeader,
    /// Handler return state (0 on failure)
    pub ret_state: i32,
    /// Opaque response payload
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl ResponseEnvelope {
    /// Convert a decoded envelope into the user-facing response record.
    pub fn into_service_response(self) -> ServiceResponse {
        ServiceResponse {
            host_name: self.header.host_name,
            service_name: self.header.service_name,
            service_id: self.header.service_id,
            method_name: self.header.method_name,
            error_msg: self.header.error,
            ret_state: self.ret_state,
            call_state: self.header.state,
            response: self.payload,
        }
    }
}

/// Serialize a request envelope.
pub fn encode_request(req: &RequestEnvelope) -> Result<Vec<u8>, FrameError> {
    serde_json::to_vec(req).map_err(|e| FrameError::Envelope(e.to_string()))
}

/// Deserialize a request envelope.
pub fn decode_request(bytes: &[u8]) -> Result<RequestEnvelope, FrameError> {
    serde_json::from_slice(bytes).map_err(|e| FrameError::Envelope(e.to_string()))
}

/// Serialize a response envelope.
pub fn encode_response(resp: &ResponseEnvelope) -> Result<Vec<u8>, FrameError> {
    serde_json::to_vec(resp).map_err(|e| FrameError::Envelope(e.to_string()))
}

/// Deserialize a response envelope.
pub fn decode_response(bytes: &[u8]) -> Result<ResponseEnvelope, FrameError> {
    serde_json::from_slice(bytes).map_err(|e| FrameError::Envelope(e.to_string()))
}
