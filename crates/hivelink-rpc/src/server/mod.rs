// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service server: expose named methods over TCP.
//!
//! A [`ServiceServer`] binds a listen port, accepts connections, and runs a
//! versioned request/response session per connection. Method handlers run
//! synchronously on the session they were called from; a slow handler
//! stalls its own connection only.
//!
//! # Example
//!
//! ```rust,no_run
//! use hivelink_rpc::{MethodTable, RpcConfig, RpcRuntime, ServiceServer};
//!
//! # fn main() -> Result<(), hivelink_rpc::RpcError> {
//! let runtime = RpcRuntime::new(&RpcConfig::default())?;
//!
//! let methods = MethodTable::new();
//! methods.add("echo", |payload: &[u8]| Ok((0, payload.to_vec())));
//!
//! let server = ServiceServer::builder("mirror")
//!     .handle(runtime.handle())
//!     .methods(methods)
//!     .build()?;
//! println!("serving on port {}", server.get_port());
//! # Ok(())
//! # }
//! ```

mod acceptor;
pub mod registry;
pub(crate) mod session;

pub use registry::{MethodHandler, MethodTable};
pub use session::ServerEventCallback;

use crate::config::RpcConfig;
use crate::discovery::DiscoveryBus;
use crate::error::{RpcError, RpcResult};
use crate::types::{next_service_id, HostIdentity, RegistrationSample, ServerEvent};
use acceptor::Acceptor;
use session::{ResponderIdentity, SessionContext};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;

/// A running service endpoint.
pub struct ServiceServer {
    service_name: String,
    service_id: String,
    version: u8,
    methods: MethodTable,
    acceptor: Arc<Acceptor>,
    requests_served: Arc<AtomicU64>,
    discovery: Option<Arc<dyn DiscoveryBus>>,
    sample: RegistrationSample,
    stopped: AtomicBool,
}

impl std::fmt::Debug for ServiceServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceServer")
            .field("service_name", &self.service_name)
            .field("service_id", &self.service_id)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ServiceServer`].
pub struct ServiceServerBuilder {
    service_name: String,
    config: RpcConfig,
    handle: Option<Handle>,
    port: u16,
    version: u8,
    identity: Option<HostIdentity>,
    discovery: Option<Arc<dyn DiscoveryBus>>,
    event_cb: Option<ServerEventCallback>,
    methods: MethodTable,
}

impl ServiceServerBuilder {
    /// Set the runtime handle sessions run on (required).
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Override the default configuration.
    pub fn config(mut self, config: RpcConfig) -> Self {
        self.config = config;
        self
    }

    /// Listen port; 0 (the default) binds an ephemeral port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Protocol version to serve (default 1).
    pub fn version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Identity stamped into responses (defaults to [`HostIdentity::local`]).
    pub fn identity(mut self, identity: HostIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Announce this server on a registration bus.
    pub fn discovery(mut self, bus: Arc<dyn DiscoveryBus>) -> Self {
        self.discovery = Some(bus);
        self
    }

    /// Observe connection events.
    pub fn event_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(ServerEvent, &str) + Send + Sync + 'static,
    {
        self.event_cb = Some(Arc::new(callback));
        self
    }

    /// Use an existing method table (it can keep being mutated afterwards).
    pub fn methods(mut self, methods: MethodTable) -> Self {
        self.methods = methods;
        self
    }

    /// Register a single method handler.
    pub fn method<H: MethodHandler>(self, name: &str, handler: H) -> Self {
        self.methods.add(name, handler);
        self
    }

    /// Bind the port, start accepting, and announce on the bus.
    pub fn build(self) -> RpcResult<ServiceServer> {
        self.config.validate().map_err(RpcError::Config)?;
        let handle = self.handle.ok_or(RpcError::MissingField("handle"))?;
        let identity = self.identity.unwrap_or_else(HostIdentity::local);
        let service_id = next_service_id();

        let listener = std::net::TcpListener::bind(("0.0.0.0", self.port)).map_err(|e| {
            RpcError::Bind {
                port: self.port,
                source: e,
            }
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let requests_served = Arc::new(AtomicU64::new(0));
        let ctx = Arc::new(SessionContext {
            identity: ResponderIdentity {
                host_name: identity.host_name.clone(),
                service_name: self.service_name.clone(),
                service_id: service_id.clone(),
            },
            methods: self.methods.clone(),
            event_cb: self.event_cb,
            requests_served: Arc::clone(&requests_served),
            max_frame_size: self.config.max_frame_size,
        });

        let acceptor = Acceptor::new(local_addr);
        Arc::clone(&acceptor).start(&handle, listener, self.version, ctx, self.config.nodelay);

        let sample = RegistrationSample {
            identity,
            service_name: self.service_name.clone(),
            service_id: service_id.clone(),
            version: self.version,
            tcp_port_v0: if self.version == 0 { local_addr.port() } else { 0 },
            tcp_port_v1: if self.version == 0 { 0 } else { local_addr.port() },
        };
        if let Some(bus) = &self.discovery {
            bus.register_server(&self.service_name, &service_id, &sample, false);
        }

        info!(
            service = %self.service_name,
            port = local_addr.port(),
            version = self.version,
            "service server created"
        );

        Ok(ServiceServer {
            service_name: self.service_name,
            service_id,
            version: self.version,
            methods: self.methods,
            acceptor,
            requests_served,
            discovery: self.discovery,
            sample,
            stopped: AtomicBool::new(false),
        })
    }
}

impl ServiceServer {
    /// Start building a server for `service_name`.
    pub fn builder(service_name: &str) -> ServiceServerBuilder {
        ServiceServerBuilder {
            service_name: service_name.to_string(),
            config: RpcConfig::default(),
            handle: None,
            port: 0,
            version: 1,
            identity: None,
            discovery: None,
            event_cb: None,
            methods: MethodTable::new(),
        }
    }

    /// Service name this server implements.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Instance id of this server.
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Protocol version advertised.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Bound listen port (resolves an ephemeral bind).
    pub fn get_port(&self) -> u16 {
        self.acceptor.local_port()
    }

    /// Number of currently connected clients.
    pub fn get_connection_count(&self) -> usize {
        self.acceptor.connection_count()
    }

    /// True when at least one client is connected.
    pub fn is_connected(&self) -> bool {
        self.get_connection_count() > 0
    }

    /// Total requests answered across all sessions.
    pub fn requests_served(&self) -> u64 {
        self.requests_served.load(Ordering::Relaxed)
    }

    /// Register a method handler, replacing any previous one.
    pub fn add_method<H: MethodHandler>(&self, name: &str, handler: H) {
        self.methods.add(name, handler);
    }

    /// Remove a method handler. Returns whether one was registered.
    pub fn remove_method(&self, name: &str) -> bool {
        self.methods.remove(name)
    }

    /// Names of all registered methods.
    pub fn method_names(&self) -> Vec<String> {
        self.methods.method_names()
    }

    /// Registration pull hook; the bus calls this roughly once a second
    /// to keep the announcement alive.
    pub fn refresh_registration(&self) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if let Some(bus) = &self.discovery {
            bus.register_server(&self.service_name, &self.service_id, &self.sample, false);
        }
    }

    /// Stop accepting, tear down live sessions, retract the announcement.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(service = %self.service_name, "service server stopping");
        self.acceptor.stop();
        if let Some(bus) = &self.discovery {
            bus.unregister_server(&self.service_name, &self.service_id, &self.sample, true);
        }
    }
}

impl Drop for ServiceServer {
    fn drop(&mut self) {
        self.stop();
    }
}
