// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # hivelink-rpc — service RPC for the hivelink middleware
//!
//! Lets a process expose named method endpoints over TCP and lets other
//! processes invoke them across the fleet. A service is hosted by any
//! number of server processes; a client bound to the service name discovers
//! them all and fans every logical call out into concurrent remote calls.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use hivelink_rpc::{
//!     ClientManager, MemoryBus, MethodTable, RpcConfig, RpcRuntime, ServiceClient, ServiceServer,
//! };
//!
//! fn main() -> Result<(), hivelink_rpc::RpcError> {
//!     let runtime = RpcRuntime::new(&RpcConfig::default())?;
//!     let bus = MemoryBus::new();
//!
//!     // Serve "mirror/echo"
//!     let methods = MethodTable::new();
//!     methods.add("echo", |payload: &[u8]| Ok((0, payload.to_vec())));
//!     let server = ServiceServer::builder("mirror")
//!         .handle(runtime.handle())
//!         .discovery(bus.clone())
//!         .methods(methods)
//!         .build()?;
//!
//!     // Call it from a client
//!     let manager = ClientManager::new(runtime.handle(), RpcConfig::default());
//!     let client = ServiceClient::builder("mirror")
//!         .manager(manager.clone())
//!         .discovery(bus)
//!         .build()?;
//!
//!     let mut responses = Vec::new();
//!     client.call("echo", b"hello", 1000, &mut responses);
//!
//!     client.destroy();
//!     server.stop();
//!     manager.stop();
//!     runtime.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |  ServiceClient            fan-out, events     ServiceServer        |
//! |     | peer map                                   | method table    |
//! |  ClientManager ── ClientSession  ...  session ── Acceptor          |
//! |     |                  |                |           |              |
//! |  +--------------- frame codec (v0 / v1 envelopes) ----------------+|
//! |  |                    shared I/O runtime (RpcRuntime)             ||
//! |  +----------------------------------------------------------------+|
//! +--------------------------------------------------------------------+
//! ```
//!
//! Peer discovery is consumed through the [`DiscoveryBus`] trait; the
//! bundled [`MemoryBus`] covers tests and single-process wiring.
//!
//! ## Ordering and delivery
//!
//! - Within one session, requests and responses complete in submission
//!   order; across sessions nothing is ordered.
//! - Every pending call resolves exactly once (response, transport error,
//!   or shutdown). There are no exactly-once delivery semantics; callers
//!   that retry tolerate duplicates.
//! - The transport is a trusted LAN: no authentication, no encryption.

/// Service client: discovery-driven fan-out calls.
pub mod client;
/// Configuration for servers, clients and the runtime.
pub mod config;
/// Registration bus contract and in-memory implementation.
pub mod discovery;
/// Error taxonomy.
pub mod error;
/// Wire envelopes and transport framing.
pub mod protocol;
/// Process-scoped I/O runtime.
pub mod runtime;
/// Service server: expose named methods over TCP.
pub mod server;
/// Common data types.
pub mod types;

pub use client::{ClientManager, ClientSession, Completion, ResponseCallback, ServiceClient};
pub use config::RpcConfig;
pub use discovery::{DiscoveryBus, MemoryBus};
pub use error::{CallError, RpcError, RpcResult};
pub use runtime::RpcRuntime;
pub use server::{MethodHandler, MethodTable, ServiceServer};
pub use types::{
    CallState, ClientEvent, ClientEventData, HostIdentity, PeerDescriptor, RegistrationSample,
    ServerEvent, ServiceResponse, SessionState,
};
