// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service client: discovery-driven fan-out calls.
//!
//! A [`ServiceClient`] is bound to a service name. It keeps one
//! [`ClientSession`] per discovered peer and multiplexes every logical call
//! into concurrent remote calls against all matching peers, aggregating the
//! responses (blocking variant) or streaming them through the response
//! callback.
//!
//! # Example
//!
//! ```rust,no_run
//! use hivelink_rpc::{ClientManager, MemoryBus, RpcConfig, RpcRuntime, ServiceClient};
//!
//! # fn main() -> Result<(), hivelink_rpc::RpcError> {
//! let runtime = RpcRuntime::new(&RpcConfig::default())?;
//! let bus = MemoryBus::new();
//! let manager = ClientManager::new(runtime.handle(), RpcConfig::default());
//!
//! let client = ServiceClient::builder("mirror")
//!     .manager(manager)
//!     .discovery(bus)
//!     .build()?;
//!
//! let mut responses = Vec::new();
//! if client.call("echo", b"hi", 1000, &mut responses) {
//!     for response in &responses {
//!         println!("{}: {:?}", response.host_name, response.response);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod manager;
pub(crate) mod session;

pub use manager::ClientManager;
pub use session::{ClientSession, Completion, SessionEventCallback};

use crate::discovery::DiscoveryBus;
use crate::error::{RpcError, RpcResult};
use crate::protocol::{self, RequestEnvelope, RequestHeader};
use crate::types::{
    next_service_id, CallState, ClientEvent, ClientEventData, HostIdentity, PeerDescriptor,
    RegistrationSample, ServiceResponse, SessionState,
};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Protocol version this client announces.
const CLIENT_PROTOCOL_VERSION: u8 = 1;

/// Callback receiving one response record per answering peer.
pub type ResponseCallback = Arc<dyn Fn(&ServiceResponse) + Send + Sync>;

/// Callback receiving connection events.
pub type ClientEventCallback = Box<dyn Fn(&ClientEventData) + Send + Sync>;

/// Shared aggregation state of one blocking fan-out call.
///
/// Held in a single `Arc` captured by every per-peer completion, so a
/// completion firing after the caller timed out and returned still writes
/// into live memory; nobody reads the aggregator after the call returns,
/// which makes the late write harmless.
struct FanOut {
    state: Mutex<FanOutState>,
    done: Condvar,
}

struct FanOutState {
    slots: Vec<ServiceResponse>,
    finished: usize,
    expected: usize,
}

impl FanOut {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FanOutState {
                slots: Vec::new(),
                finished: 0,
                expected: 0,
            }),
            done: Condvar::new(),
        })
    }
}

/// A logical client for one service name.
pub struct ServiceClient {
    service_name: String,
    service_id: String,
    identity: HostIdentity,
    discovery: Arc<dyn DiscoveryBus>,
    manager: Arc<ClientManager>,
    host_filter: Mutex<Option<String>>,
    // Lock order: peer_sessions → connected_services → event_callbacks →
    // response_callback. Never acquire an earlier lock while holding a
    // later one.
    peer_sessions: Mutex<HashMap<String, Arc<ClientSession>>>,
    connected_services: Mutex<HashMap<String, PeerDescriptor>>,
    event_callbacks: Mutex<HashMap<ClientEvent, ClientEventCallback>>,
    response_callback: Arc<Mutex<Option<ResponseCallback>>>,
    created: AtomicBool,
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("service_name", &self.service_name)
            .field("service_id", &self.service_id)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ServiceClient`].
pub struct ServiceClientBuilder {
    service_name: String,
    manager: Option<Arc<ClientManager>>,
    discovery: Option<Arc<dyn DiscoveryBus>>,
    identity: Option<HostIdentity>,
    host_filter: Option<String>,
}

impl ServiceClientBuilder {
    /// Set the session factory (required).
    pub fn manager(mut self, manager: Arc<ClientManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Set the registration bus (required).
    pub fn discovery(mut self, bus: Arc<dyn DiscoveryBus>) -> Self {
        self.discovery = Some(bus);
        self
    }

    /// Identity announced on the bus (defaults to [`HostIdentity::local`]).
    pub fn identity(mut self, identity: HostIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Restrict calls to peers on one host (`"*"` means any).
    pub fn host_filter(mut self, host_name: &str) -> Self {
        self.host_filter = normalize_filter(host_name);
        self
    }

    /// Build the client and register it on the bus.
    pub fn build(self) -> RpcResult<ServiceClient> {
        let manager = self.manager.ok_or(RpcError::MissingField("manager"))?;
        let discovery = self.discovery.ok_or(RpcError::MissingField("discovery"))?;
        let client = ServiceClient {
            service_name: self.service_name,
            service_id: next_service_id(),
            identity: self.identity.unwrap_or_else(HostIdentity::local),
            discovery,
            manager,
            host_filter: Mutex::new(self.host_filter),
            peer_sessions: Mutex::new(HashMap::new()),
            connected_services: Mutex::new(HashMap::new()),
            event_callbacks: Mutex::new(HashMap::new()),
            response_callback: Arc::new(Mutex::new(None)),
            created: AtomicBool::new(true),
        };
        client.register(false);
        Ok(client)
    }
}

fn normalize_filter(host_name: &str) -> Option<String> {
    if host_name.is_empty() || host_name == "*" {
        None
    } else {
        Some(host_name.to_string())
    }
}

impl ServiceClient {
    /// Start building a client for `service_name`.
    pub fn builder(service_name: &str) -> ServiceClientBuilder {
        ServiceClientBuilder {
            service_name: service_name.to_string(),
            manager: None,
            discovery: None,
            identity: None,
            host_filter: None,
        }
    }

    /// Service name this client calls.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Instance id announced on the bus.
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Restrict calls to peers on one host. `"*"` (or empty) clears.
    pub fn set_host_filter(&self, host_name: &str) {
        *self.host_filter.lock() = normalize_filter(host_name);
    }

    /// Install the response callback used by the callback call variants.
    pub fn set_response_callback<F>(&self, callback: F)
    where
        F: Fn(&ServiceResponse) + Send + Sync + 'static,
    {
        *self.response_callback.lock() = Some(Arc::new(callback));
    }

    /// Remove the response callback. Completions that fire afterwards
    /// observe the empty slot and drop their response.
    pub fn clear_response_callback(&self) {
        *self.response_callback.lock() = None;
    }

    /// Install a callback for one event kind.
    pub fn set_event_callback<F>(&self, event: ClientEvent, callback: F)
    where
        F: Fn(&ClientEventData) + Send + Sync + 'static,
    {
        self.event_callbacks.lock().insert(event, Box::new(callback));
    }

    /// Remove the callback for one event kind.
    pub fn remove_event_callback(&self, event: ClientEvent) {
        self.event_callbacks.lock().remove(&event);
    }

    /// True while at least one peer is connected.
    pub fn is_connected(&self) -> bool {
        self.created.load(Ordering::Acquire) && !self.connected_services.lock().is_empty()
    }

    /// Registration pull hook; the bus calls this roughly once a second.
    ///
    /// Re-announces the client, refreshes peer sessions from the current
    /// snapshot, reaps failed sessions, and emits connect/disconnect events
    /// on the transitions observed since the last pass.
    pub fn refresh_registration(&self) {
        if !self.created.load(Ordering::Acquire) {
            return;
        }
        self.register(false);
    }

    /// Blocking fan-out call.
    ///
    /// Dispatches to every matching peer, waits up to `timeout_ms`
    /// (0 = indefinitely) for all of them, and fills `responses` with one
    /// slot per dispatched peer. Peers that did not answer in time keep the
    /// pre-filled timeout outcome. Returns `true` iff at least one slot
    /// executed; `false` when no peer matched.
    pub fn call(
        &self,
        method_name: &str,
        request: &[u8],
        timeout_ms: u64,
        responses: &mut Vec<ServiceResponse>,
    ) -> bool {
        responses.clear();
        let aggregator = match self.dispatch_fan_out(method_name, request) {
            Some(aggregator) => aggregator,
            None => return false,
        };

        let deadline =
            (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        let mut state = aggregator.state.lock();
        while state.finished < state.expected {
            match deadline {
                Some(deadline) => {
                    if aggregator.done.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => aggregator.done.wait(&mut state),
            }
        }

        responses.extend(state.slots.iter().cloned());
        responses
            .iter()
            .any(|slot| slot.call_state == CallState::Executed)
    }

    /// Blocking fan-out that feeds each aggregated slot through the
    /// response callback instead of an output vector.
    pub fn call_with_callback(&self, method_name: &str, request: &[u8], timeout_ms: u64) -> bool {
        let mut responses = Vec::new();
        let success = self.call(method_name, request, timeout_ms, &mut responses);
        for response in &responses {
            let guard = self.response_callback.lock();
            if let Some(callback) = guard.as_ref() {
                callback(response);
            }
        }
        success
    }

    /// Fire-and-forget fan-out: each peer's completion invokes the response
    /// callback directly, whenever it resolves.
    ///
    /// Returns `true` iff at least one peer was dispatched to.
    pub fn call_async(&self, method_name: &str, request: &[u8]) -> bool {
        if !self.created.load(Ordering::Acquire) {
            self.error_callback(method_name, "client has been destroyed");
            return false;
        }
        if self.service_name.is_empty() || method_name.is_empty() {
            self.error_callback(method_name, "invalid service or method name");
            return false;
        }

        let peers = self.check_for_new_services();
        let request_bytes = match self.encode_request(method_name, request) {
            Some(bytes) => bytes,
            None => return false,
        };
        let host_filter = self.host_filter.lock().clone();

        let mut dispatched = false;
        for peer in peers {
            if !host_matches(&host_filter, &peer.host_name) {
                continue;
            }
            let session = self.peer_sessions.lock().get(&peer.key).cloned();
            let Some(session) = session else { continue };

            // The completion owns only the shared callback slot, never the
            // client itself: destroy() empties the slot and any late
            // completion quietly drops its response.
            let callback_slot = Arc::clone(&self.response_callback);
            let host_name = peer.host_name.clone();
            let service_name = peer.service_name.clone();
            let method = method_name.to_string();
            let completion = Completion::new(move |outcome| {
                let guard = callback_slot.lock();
                let Some(callback) = guard.as_ref() else {
                    return;
                };
                let response = match outcome {
                    Ok(envelope) => envelope.into_service_response(),
                    Err(error) => ServiceResponse::from_error(
                        &host_name,
                        &service_name,
                        &method,
                        &error.to_string(),
                    ),
                };
                callback(&response);
            });

            session.async_call(request_bytes.clone(), completion);
            dispatched = true;
        }
        dispatched
    }

    /// Tear the client down: clear every map under its lock, drop the
    /// callbacks, and retract the bus registration. In-flight completions
    /// keep running against the detached shared state.
    pub fn destroy(&self) -> bool {
        if !self.created.swap(false, Ordering::AcqRel) {
            return false;
        }
        debug!(service = %self.service_name, "service client destroyed");

        let sessions: Vec<Arc<ClientSession>> = {
            let mut map = self.peer_sessions.lock();
            map.drain().map(|(_, session)| session).collect()
        };
        self.connected_services.lock().clear();
        self.event_callbacks.lock().clear();
        *self.response_callback.lock() = None;

        // Outside every lock: stopping a session resolves its pending
        // completions, which may take the callback mutex themselves.
        for session in sessions {
            session.stop();
        }

        self.discovery.unregister_client(
            &self.service_name,
            &self.service_id,
            &self.sample(),
            true,
        );
        true
    }

    fn sample(&self) -> RegistrationSample {
        RegistrationSample {
            identity: self.identity.clone(),
            service_name: self.service_name.clone(),
            service_id: self.service_id.clone(),
            version: CLIENT_PROTOCOL_VERSION,
            tcp_port_v0: 0,
            tcp_port_v1: 0,
        }
    }

    fn encode_request(&self, method_name: &str, request: &[u8]) -> Option<Vec<u8>> {
        let envelope = RequestEnvelope {
            header: RequestHeader {
                method_name: method_name.to_string(),
                caller: self.identity.clone(),
            },
            payload: request.to_vec(),
        };
        protocol::encode_request(&envelope).ok()
    }

    /// Announce on the bus, refresh sessions, and emit connection events.
    fn register(&self, force: bool) {
        if self.service_name.is_empty() {
            return;
        }
        self.discovery
            .register_client(&self.service_name, &self.service_id, &self.sample(), force);

        let peers = self.check_for_new_services();

        let mut sessions = self.peer_sessions.lock();

        // Reap failed sessions: pair every earlier `connected` with exactly
        // one `disconnected`, and make room for a fresh session on the next
        // refresh (failed sessions are never reused).
        let failed_keys: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.state() == SessionState::Failed)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &failed_keys {
            sessions.remove(key);
            let mut connected = self.connected_services.lock();
            if let Some(peer) = connected.remove(key) {
                self.emit_event(ClientEvent::Disconnected, peer);
            }
        }

        // Newly discovered peers with a live session become `connected`,
        // at most once per session incarnation.
        for peer in peers {
            let live = sessions
                .get(&peer.key)
                .map(|session| session.state() != SessionState::Failed)
                .unwrap_or(false);
            if !live {
                continue;
            }
            let mut connected = self.connected_services.lock();
            if !connected.contains_key(&peer.key) {
                connected.insert(peer.key.clone(), peer.clone());
                self.emit_event(ClientEvent::Connected, peer);
            }
        }
    }

    /// Pull the peer snapshot and open sessions for unknown peers.
    ///
    /// Vanished peers are not removed here; failed sessions are reaped
    /// lazily by [`ServiceClient::register`].
    fn check_for_new_services(&self) -> Vec<PeerDescriptor> {
        if !self.created.load(Ordering::Acquire) {
            return Vec::new();
        }
        let peers = self.discovery.peers_for(&self.service_name);
        for peer in &peers {
            let mut sessions = self.peer_sessions.lock();
            if sessions.contains_key(&peer.key) {
                continue;
            }
            let (version, port) = peer.negotiated();
            let event_cb: SessionEventCallback = Arc::new(|_, _| {});
            let Some(session) = self
                .manager
                .create_client(version, &peer.host_name, port, event_cb)
            else {
                // Manager stopped: no further sessions this pass
                break;
            };
            debug!(service = %self.service_name, key = %peer.key, version, port, "peer session created");
            sessions.insert(peer.key.clone(), session);
        }
        peers
    }

    fn dispatch_fan_out(&self, method_name: &str, request: &[u8]) -> Option<Arc<FanOut>> {
        if !self.created.load(Ordering::Acquire) {
            return None;
        }
        if self.service_name.is_empty() || method_name.is_empty() {
            return None;
        }

        let peers = self.check_for_new_services();
        let request_bytes = self.encode_request(method_name, request)?;
        let host_filter = self.host_filter.lock().clone();

        let aggregator = FanOut::new();
        for peer in peers {
            if !host_matches(&host_filter, &peer.host_name) {
                continue;
            }
            let session = self.peer_sessions.lock().get(&peer.key).cloned();
            let Some(session) = session else { continue };

            // Pre-fill the slot with the timeout outcome; the completion
            // overwrites it if the peer answers.
            let index = {
                let mut state = aggregator.state.lock();
                state.slots.push(ServiceResponse::timeout(&peer, method_name));
                state.expected += 1;
                state.slots.len() - 1
            };

            let shared = Arc::clone(&aggregator);
            let completion = Completion::new(move |outcome| {
                let mut state = shared.state.lock();
                match outcome {
                    Ok(envelope) => state.slots[index] = envelope.into_service_response(),
                    Err(error) => {
                        let slot = &mut state.slots[index];
                        slot.error_msg = error.to_string();
                        slot.call_state = CallState::Failed;
                        slot.ret_state = 0;
                    }
                }
                state.finished += 1;
                shared.done.notify_all();
            });

            session.async_call(request_bytes.clone(), completion);
        }

        let dispatched = aggregator.state.lock().expected;
        if dispatched == 0 {
            None
        } else {
            Some(aggregator)
        }
    }

    fn emit_event(&self, event: ClientEvent, peer: PeerDescriptor) {
        let callbacks = self.event_callbacks.lock();
        if let Some(callback) = callbacks.get(&event) {
            callback(&ClientEventData::now(event, peer));
        }
    }

    /// Surface an early local failure through the response callback, the
    /// same way a remote failure would arrive.
    fn error_callback(&self, method_name: &str, error_msg: &str) {
        let guard = self.response_callback.lock();
        if let Some(callback) = guard.as_ref() {
            let response = ServiceResponse::from_error("", &self.service_name, method_name, error_msg);
            callback(&response);
        }
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn host_matches(filter: &Option<String>, host_name: &str) -> bool {
    match filter {
        Some(filter) => filter == host_name,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcConfig;
    use crate::discovery::MemoryBus;
    use crate::runtime::RpcRuntime;

    fn harness() -> (RpcRuntime, Arc<MemoryBus>, Arc<ClientManager>) {
        let runtime = RpcRuntime::new(&RpcConfig::default()).unwrap();
        let bus = MemoryBus::new();
        let manager = ClientManager::new(runtime.handle(), RpcConfig::default());
        (runtime, bus, manager)
    }

    #[test]
    fn builder_requires_collaborators() {
        let err = ServiceClient::builder("mirror").build().unwrap_err();
        assert!(matches!(err, RpcError::MissingField(_)));
    }

    #[test]
    fn call_with_no_peers_returns_false_and_empty_output() {
        let (runtime, bus, manager) = harness();
        let client = ServiceClient::builder("mirror")
            .manager(manager)
            .discovery(bus)
            .build()
            .unwrap();

        let mut responses = vec![ServiceResponse::from_error("", "", "", "stale")];
        assert!(!client.call("echo", b"hi", 100, &mut responses));
        assert!(responses.is_empty());

        client.destroy();
        runtime.stop();
    }

    #[test]
    fn call_async_without_peers_returns_false() {
        let (runtime, bus, manager) = harness();
        let client = ServiceClient::builder("mirror")
            .manager(manager)
            .discovery(bus)
            .build()
            .unwrap();
        assert!(!client.call_async("echo", b"hi"));
        client.destroy();
        runtime.stop();
    }

    #[test]
    fn empty_method_name_is_rejected() {
        let (runtime, bus, manager) = harness();
        let client = ServiceClient::builder("mirror")
            .manager(manager)
            .discovery(bus)
            .build()
            .unwrap();
        let mut responses = Vec::new();
        assert!(!client.call("", b"", 100, &mut responses));
        client.destroy();
        runtime.stop();
    }

    #[test]
    fn destroy_is_idempotent_and_disconnects() {
        let (runtime, bus, manager) = harness();
        let client = ServiceClient::builder("mirror")
            .manager(manager)
            .discovery(Arc::clone(&bus) as Arc<dyn DiscoveryBus>)
            .build()
            .unwrap();

        assert!(client.destroy());
        assert!(!client.destroy());
        assert!(!client.is_connected());
        // A destroyed client no longer dispatches
        let mut responses = Vec::new();
        assert!(!client.call("echo", b"", 10, &mut responses));
        runtime.stop();
    }

    #[test]
    fn host_filter_normalization() {
        assert_eq!(normalize_filter("*"), None);
        assert_eq!(normalize_filter(""), None);
        assert_eq!(normalize_filter("node-a"), Some("node-a".to_string()));

        assert!(host_matches(&None, "anything"));
        assert!(host_matches(&Some("node-a".into()), "node-a"));
        assert!(!host_matches(&Some("node-a".into()), "node-b"));
    }

    #[test]
    fn client_registers_and_unregisters_on_the_bus() {
        let (runtime, bus, manager) = harness();
        let client = ServiceClient::builder("mirror")
            .manager(manager)
            .discovery(Arc::clone(&bus) as Arc<dyn DiscoveryBus>)
            .build()
            .unwrap();
        // Client announcements never become peers
        assert!(bus.peers_for("mirror").is_empty());
        client.destroy();
        runtime.stop();
    }
}
