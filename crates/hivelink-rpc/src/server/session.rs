// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection server sessions.
//!
//! Each accepted connection runs one session task on the shared runtime;
//! that task is the session's serialization context — reads, user handler
//! dispatch, and writes for one connection never run concurrently. The
//! session is owned by its own task; the acceptor only holds a weak handle
//! and is told to drop it through the shutdown callback when the task ends.
//!
//! State machine: `Running → Stopping → Stopped`. `stop()` requests the
//! transition; an in-flight write completes, the next read is abandoned.

use crate::protocol::frame::{self, FrameError};
use crate::protocol::{self, ResponseEnvelope, ResponseHeader};
use crate::server::registry::{Dispatch, MethodTable};
use crate::types::{CallState, ServerEvent};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Callback fired on server connection transitions.
pub type ServerEventCallback = Arc<dyn Fn(ServerEvent, &str) + Send + Sync>;

/// Invoked by a terminating session so the acceptor can purge its entry.
pub(crate) type ShutdownCallback = Arc<dyn Fn(&Arc<ServerSession>) + Send + Sync>;

const STATE_RUNNING: u8 = 0;
const STATE_STOPPING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Identity stamped into every response this server produces.
#[derive(Debug, Clone)]
pub(crate) struct ResponderIdentity {
    pub host_name: String,
    pub service_name: String,
    pub service_id: String,
}

/// State shared by all sessions of one server.
pub(crate) struct SessionContext {
    pub identity: ResponderIdentity,
    pub methods: MethodTable,
    pub event_cb: Option<ServerEventCallback>,
    pub requests_served: Arc<AtomicU64>,
    pub max_frame_size: usize,
}

/// One accepted connection.
pub(crate) struct ServerSession {
    peer_addr: SocketAddr,
    version: u8,
    state: AtomicU8,
    stop_notify: Notify,
}

impl ServerSession {
    pub(crate) fn new(peer_addr: SocketAddr, version: u8) -> Arc<Self> {
        Arc::new(Self {
            peer_addr,
            version,
            state: AtomicU8::new(STATE_RUNNING),
            stop_notify: Notify::new(),
        })
    }

    /// Request teardown. Idempotent; the session task finishes its current
    /// write and then exits.
    pub(crate) fn stop(&self) {
        let _ = self.state.compare_exchange(
            STATE_RUNNING,
            STATE_STOPPING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        // A stored permit covers the stop-before-first-read race
        self.stop_notify.notify_one();
    }

    /// Start the session task.
    pub(crate) fn start(
        self: Arc<Self>,
        handle: &Handle,
        stream: TcpStream,
        ctx: Arc<SessionContext>,
        shutdown_cb: ShutdownCallback,
    ) {
        handle.spawn(async move {
            self.run(stream, ctx, shutdown_cb).await;
        });
    }

    async fn run(self: Arc<Self>, mut stream: TcpStream, ctx: Arc<SessionContext>, shutdown_cb: ShutdownCallback) {
        let peer = self.peer_addr.to_string();
        debug!(peer = %peer, version = self.version, "server session started");
        if let Some(cb) = &ctx.event_cb {
            cb(ServerEvent::Connected, &peer);
        }

        let reason = if self.version == 0 {
            self.serve_v0(&mut stream, &ctx).await
        } else {
            self.serve_v1(&mut stream, &ctx).await
        };

        self.state.store(STATE_STOPPED, Ordering::Release);
        debug!(peer = %peer, reason = %reason, "server session ended");
        if let Some(cb) = &ctx.event_cb {
            cb(ServerEvent::Disconnected, &reason);
        }
        shutdown_cb(&self);
    }

    /// v1: length-prefixed frames, pipelining allowed, responses written in
    /// receive order. Runs until transport error, decode error, or stop.
    async fn serve_v1(&self, stream: &mut TcpStream, ctx: &SessionContext) -> String {
        loop {
            let payload = tokio::select! {
                _ = self.stop_notify.notified() => return "session stopped".to_string(),
                read = frame::read_v1(stream, ctx.max_frame_size) => match read {
                    Ok(payload) => payload,
                    Err(FrameError::Closed) => return "connection closed by peer".to_string(),
                    Err(e) if e.is_decode() => {
                        warn!(peer = %self.peer_addr, error = %e, "closing session on decode error");
                        return format!("decode error: {e}");
                    }
                    Err(e) => return format!("read error: {e}"),
                },
            };

            let response = match self.process(ctx, &payload) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(peer = %self.peer_addr, error = %e, "closing session on decode error");
                    return format!("decode error: {e}");
                }
            };

            if let Err(e) = frame::write_v1(stream, &response).await {
                return format!("write error: {e}");
            }
            ctx.requests_served.fetch_add(1, Ordering::Relaxed);

            if self.state.load(Ordering::Acquire) == STATE_STOPPING {
                return "session stopped".to_string();
            }
        }
    }

    /// v0: one bounded read, one response, then close. The legacy protocol
    /// is one-shot per connection.
    async fn serve_v0(&self, stream: &mut TcpStream, ctx: &SessionContext) -> String {
        let payload = tokio::select! {
            _ = self.stop_notify.notified() => return "session stopped".to_string(),
            read = frame::read_v0(stream) => match read {
                Ok(payload) => payload,
                Err(FrameError::Closed) => return "connection closed by peer".to_string(),
                Err(e) => return format!("read error: {e}"),
            },
        };

        let response = match self.process(ctx, &payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %self.peer_addr, error = %e, "closing session on decode error");
                return format!("decode error: {e}");
            }
        };

        if let Err(e) = frame::write_v0(stream, &response).await {
            return format!("write error: {e}");
        }
        ctx.requests_served.fetch_add(1, Ordering::Relaxed);
        "request served".to_string()
    }

    /// Decode one request, run the handler on this task, encode the
    /// response. Handler failures stay inside the response; only envelope
    /// decode failures bubble up (and close the session).
    fn process(&self, ctx: &SessionContext, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        let request = protocol::decode_request(payload)?;
        let method_name = request.header.method_name;

        let (state, error, ret_state, body) = match ctx.methods.dispatch(&method_name, &request.payload) {
            Dispatch::Executed { ret_state, payload } => {
                (CallState::Executed, String::new(), ret_state, payload)
            }
            Dispatch::HandlerFailed { error } => (CallState::Failed, error, 0, Vec::new()),
            Dispatch::UnknownMethod => (
                CallState::Failed,
                format!("method '{method_name}' not found"),
                0,
                Vec::new(),
            ),
        };

        let envelope = ResponseEnvelope {
            header: ResponseHeader {
                host_name: ctx.identity.host_name.clone(),
                service_name: ctx.identity.service_name.clone(),
                service_id: ctx.identity.service_id.clone(),
                method_name,
                error,
                state,
            },
            ret_state,
            payload: body,
        };
        protocol::encode_response(&envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RequestEnvelope, RequestHeader};
    use crate::types::HostIdentity;

    fn ctx() -> SessionContext {
        let methods = MethodTable::new();
        methods.add("echo", |payload: &[u8]| Ok((7, payload.to_vec())));
        methods.add("broken", |_: &[u8]| Err("handler exploded".to_string()));
        SessionContext {
            identity: ResponderIdentity {
                host_name: "node-b".into(),
                service_name: "mirror".into(),
                service_id: "42".into(),
            },
            methods,
            event_cb: None,
            requests_served: Arc::new(AtomicU64::new(0)),
            max_frame_size: 1024 * 1024,
        }
    }

    fn request(method: &str, payload: &[u8]) -> Vec<u8> {
        protocol::encode_request(&RequestEnvelope {
            header: RequestHeader {
                method_name: method.into(),
                caller: HostIdentity::local(),
            },
            payload: payload.to_vec(),
        })
        .unwrap()
    }

    fn session() -> Arc<ServerSession> {
        ServerSession::new("127.0.0.1:1".parse().unwrap(), 1)
    }

    #[test]
    fn process_executes_handler() {
        let ctx = ctx();
        let bytes = session().process(&ctx, &request("echo", b"hi")).unwrap();
        let resp = protocol::decode_response(&bytes).unwrap();
        assert_eq!(resp.header.state, CallState::Executed);
        assert_eq!(resp.header.method_name, "echo");
        assert_eq!(resp.header.host_name, "node-b");
        assert_eq!(resp.ret_state, 7);
        assert_eq!(resp.payload, b"hi");
    }

    #[test]
    fn process_reports_handler_failure() {
        let ctx = ctx();
        let bytes = session().process(&ctx, &request("broken", b"")).unwrap();
        let resp = protocol::decode_response(&bytes).unwrap();
        assert_eq!(resp.header.state, CallState::Failed);
        assert_eq!(resp.header.error, "handler exploded");
        assert_eq!(resp.ret_state, 0);
    }

    #[test]
    fn process_reports_unknown_method() {
        let ctx = ctx();
        let bytes = session().process(&ctx, &request("missing", b"")).unwrap();
        let resp = protocol::decode_response(&bytes).unwrap();
        assert_eq!(resp.header.state, CallState::Failed);
        assert_eq!(resp.header.error, "method 'missing' not found");
    }

    #[test]
    fn process_rejects_garbage() {
        let ctx = ctx();
        let err = session().process(&ctx, b"definitely not json").unwrap_err();
        assert!(err.is_decode());
    }
}
