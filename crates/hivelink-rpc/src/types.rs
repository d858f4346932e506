// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Common data types of the service RPC layer.
//!
//! These are the values that cross component boundaries: peer descriptions
//! produced by discovery, the identity of the calling process, per-call
//! response records, and the event payloads delivered to user callbacks.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of a process participating in service communication.
///
/// Supplied by the embedding process; [`HostIdentity::local`] builds one
/// from the environment for the common case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    /// Machine host name
    pub host_name: String,
    /// Executable path or name
    pub process_name: String,
    /// Logical unit name (defaults to the executable stem)
    pub unit_name: String,
    /// OS process id
    pub pid: u32,
}

impl HostIdentity {
    /// Build an identity for the current process from the environment.
    pub fn local() -> Self {
        let process_name = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let unit_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_default();
        let host_name = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "localhost".to_string());
        Self {
            host_name,
            process_name,
            unit_name,
            pid: std::process::id(),
        }
    }
}

/// One server process instance hosting a service, as reported by discovery.
///
/// At least one of the two ports is nonzero. The effective protocol version
/// and port follow [`PeerDescriptor::negotiated`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// Stable key, unique per peer process and service instance
    pub key: String,
    /// Host the peer listens on
    pub host_name: String,
    /// Service name the peer implements
    pub service_name: String,
    /// Peer's service instance id
    pub service_id: String,
    /// Listen port for protocol v0 (0 if not offered)
    pub tcp_port_v0: u16,
    /// Listen port for protocol v1 (0 if not offered)
    pub tcp_port_v1: u16,
    /// Protocol version the peer announces
    pub announced_version: u8,
}

impl PeerDescriptor {
    /// Effective `(version, port)` for connecting to this peer.
    ///
    /// The v1 port is preferred when offered; otherwise the connection
    /// falls back to protocol v0 on the v0 port.
    pub fn negotiated(&self) -> (u8, u16) {
        if self.tcp_port_v1 != 0 {
            (self.announced_version, self.tcp_port_v1)
        } else {
            (0, self.tcp_port_v0)
        }
    }
}

/// Whether the server side executed the method handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Handler ran and produced a response
    Executed,
    /// Handler failed, was not found, or the call never completed
    Failed,
}

/// Result record for one peer of a fan-out call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    /// Responding peer's host name
    pub host_name: String,
    /// Service name
    pub service_name: String,
    /// Responding peer's service instance id
    pub service_id: String,
    /// Method that was invoked
    pub method_name: String,
    /// Error description, empty on success
    pub error_msg: String,
    /// Handler return state (0 when the call failed)
    pub ret_state: i32,
    /// Whether the handler executed
    pub call_state: CallState,
    /// Response payload bytes
    pub response: Vec<u8>,
}

impl ServiceResponse {
    /// Slot default for a dispatched call: the outcome recorded if the
    /// deadline fires before the peer answers.
    pub fn timeout(peer: &PeerDescriptor, method_name: &str) -> Self {
        Self {
            host_name: peer.host_name.clone(),
            service_name: peer.service_name.clone(),
            service_id: peer.key.clone(),
            method_name: method_name.to_string(),
            error_msg: "Timeout".to_string(),
            ret_state: 0,
            call_state: CallState::Failed,
            response: Vec::new(),
        }
    }

    /// Build a failed response record from a call error.
    pub fn from_error(host_name: &str, service_name: &str, method_name: &str, msg: &str) -> Self {
        Self {
            host_name: host_name.to_string(),
            service_name: service_name.to_string(),
            service_id: String::new(),
            method_name: method_name.to_string(),
            error_msg: msg.to_string(),
            ret_state: 0,
            call_state: CallState::Failed,
            response: Vec::new(),
        }
    }
}

/// Connection state of a client session. `Failed` is terminal and sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// TCP connect in progress
    Connecting = 0,
    /// Connected and usable
    Connected = 1,
    /// Broken; the session is never reused
    Failed = 2,
}

impl SessionState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Connected,
            _ => Self::Failed,
        }
    }
}

/// Event kinds observed by a service client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEvent {
    /// A peer became callable
    Connected,
    /// A previously connected peer went away
    Disconnected,
    /// A call to a peer timed out
    Timeout,
}

/// Event kinds observed by a service server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEvent {
    /// A client connection was accepted
    Connected,
    /// A client connection terminated
    Disconnected,
}

/// Payload handed to client event callbacks.
#[derive(Debug, Clone)]
pub struct ClientEventData {
    /// Kind of transition
    pub event: ClientEvent,
    /// Microseconds since the Unix epoch at emission time
    pub time_us: u64,
    /// The peer the transition refers to
    pub peer: PeerDescriptor,
}

impl ClientEventData {
    pub(crate) fn now(event: ClientEvent, peer: PeerDescriptor) -> Self {
        let time_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        Self {
            event,
            time_us,
            peer,
        }
    }
}

/// Announcement blob pushed to the registration bus.
///
/// Servers fill in their listen ports; clients leave both at zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationSample {
    /// Identity of the announcing process
    pub identity: HostIdentity,
    /// Service name
    pub service_name: String,
    /// Instance id of the announcing client or server
    pub service_id: String,
    /// Protocol version announced
    pub version: u8,
    /// Server listen port for protocol v0 (0 if none)
    pub tcp_port_v0: u16,
    /// Server listen port for protocol v1 (0 if none)
    pub tcp_port_v1: u16,
}

impl RegistrationSample {
    /// Stable peer key for this announcement.
    pub fn peer_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.identity.host_name, self.identity.pid, self.service_name, self.service_id
        )
    }
}

/// Mint a fresh service instance id.
///
/// Epoch nanoseconds plus a process-wide counter, rendered as a string;
/// unique within the process lifetime and stable for the lifetime of the
/// owning object.
pub(crate) fn next_service_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{nanos}-{seq}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(v0: u16, v1: u16, version: u8) -> PeerDescriptor {
        PeerDescriptor {
            key: "k".into(),
            host_name: "h".into(),
            service_name: "s".into(),
            service_id: "1".into(),
            tcp_port_v0: v0,
            tcp_port_v1: v1,
            announced_version: version,
        }
    }

    #[test]
    fn negotiation_prefers_v1_port() {
        assert_eq!(peer(5000, 5001, 1).negotiated(), (1, 5001));
    }

    #[test]
    fn negotiation_falls_back_to_v0() {
        // Announced version is ignored when no v1 port is offered
        assert_eq!(peer(5000, 0, 1).negotiated(), (0, 5000));
    }

    #[test]
    fn timeout_slot_shape() {
        let slot = ServiceResponse::timeout(&peer(1, 2, 1), "echo");
        assert_eq!(slot.error_msg, "Timeout");
        assert_eq!(slot.ret_state, 0);
        assert_eq!(slot.call_state, CallState::Failed);
        assert!(slot.response.is_empty());
    }

    #[test]
    fn service_ids_are_fresh() {
        let a = next_service_id();
        let b = next_service_id();
        assert_ne!(a, b);
    }

    #[test]
    fn local_identity_has_pid() {
        let id = HostIdentity::local();
        assert_eq!(id.pid, std::process::id());
        assert!(!id.host_name.is_empty());
    }

    #[test]
    fn sample_peer_key_is_stable() {
        let sample = RegistrationSample {
            identity: HostIdentity {
                host_name: "node-a".into(),
                process_name: "/bin/app".into(),
                unit_name: "app".into(),
                pid: 42,
            },
            service_name: "mirror".into(),
            service_id: "123".into(),
            version: 1,
            tcp_port_v0: 0,
            tcp_port_v1: 9000,
        };
        assert_eq!(sample.peer_key(), "node-a:42:mirror:123");
    }
}
