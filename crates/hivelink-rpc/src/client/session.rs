// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-peer client sessions.
//!
//! A [`ClientSession`] is a persistent channel to one server process. The
//! session's writer task serializes encoding and socket writes; a reader
//! task matches incoming responses to pending completions in FIFO order
//! (the protocol answers in receive order, so no per-call correlation id
//! is needed: v0 has at most one outstanding call, v1 pipelines).
//!
//! State machine: `Connecting → Connected → Failed`. `Failed` is terminal
//! and sticky — a failed session is never reused, it is replaced by the
//! next discovery refresh.
//!
//! Timeouts are owned by the caller, not the session: a pending completion
//! stays queued after the caller gives up, and the late response resolves a
//! latch that has already fired, which is a no-op.

use crate::config::RpcConfig;
use crate::error::CallError;
use crate::protocol::{self, frame, ResponseEnvelope};
use crate::types::{ClientEvent, SessionState};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Callback observing session-level transitions.
pub type SessionEventCallback = Arc<dyn Fn(ClientEvent, &str) + Send + Sync>;

/// One-shot completion for a pending call.
///
/// The inner latch guarantees the sink runs exactly once no matter which
/// path resolves it first (response, transport error, shutdown, or drop);
/// later resolutions are no-ops.
#[derive(Clone)]
pub struct Completion {
    sink: Arc<Mutex<Option<CompletionSink>>>,
}

type CompletionSink = Box<dyn FnOnce(Result<ResponseEnvelope, CallError>) + Send>;

impl Completion {
    /// Wrap a sink function into a one-shot completion.
    pub fn new<F>(sink: F) -> Self
    where
        F: FnOnce(Result<ResponseEnvelope, CallError>) + Send + 'static,
    {
        Self {
            sink: Arc::new(Mutex::new(Some(Box::new(sink)))),
        }
    }

    /// Resolve the completion. Returns false if it already resolved.
    pub fn resolve(&self, outcome: Result<ResponseEnvelope, CallError>) -> bool {
        let sink = self.sink.lock().take();
        match sink {
            Some(sink) => {
                sink(outcome);
                true
            }
            None => false,
        }
    }

    /// Whether the completion has fired.
    pub fn is_resolved(&self) -> bool {
        self.sink.lock().is_none()
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        // Last holder going away without a resolution still fires the sink,
        // so no pending call is ever silently lost.
        if Arc::strong_count(&self.sink) == 1 {
            if let Some(sink) = self.sink.lock().take() {
                sink(Err(CallError::Shutdown));
            }
        }
    }
}

enum Command {
    Call {
        envelope: Vec<u8>,
        completion: Completion,
    },
    Stop,
}

/// Persistent channel to one peer.
pub struct ClientSession {
    host: String,
    port: u16,
    version: u8,
    max_frame_size: usize,
    state: AtomicU8,
    pending: Arc<Mutex<VecDeque<Completion>>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    event_cb: SessionEventCallback,
}

impl ClientSession {
    /// Create a session and start connecting in the background.
    ///
    /// The returned session is immediately usable: calls made while the
    /// connect is in flight are queued and written once it completes.
    pub(crate) fn connect(
        handle: &Handle,
        config: &RpcConfig,
        version: u8,
        host: &str,
        port: u16,
        event_cb: SessionEventCallback,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            host: host.to_string(),
            port,
            version,
            max_frame_size: config.max_frame_size,
            state: AtomicU8::new(SessionState::Connecting as u8),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            cmd_tx,
            event_cb,
        });

        let task = Arc::clone(&session);
        let task_handle = handle.clone();
        let connect_timeout = config.connect_timeout;
        let nodelay = config.nodelay;
        handle.spawn(async move {
            task.run(task_handle, cmd_rx, connect_timeout, nodelay).await;
        });

        session
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Peer host this session connects to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Peer port this session connects to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Submit an encoded request envelope.
    ///
    /// The completion resolves exactly once: with the decoded response,
    /// or with `Transport`/`Decode`/`Shutdown`.
    pub fn async_call(&self, envelope: Vec<u8>, completion: Completion) {
        if self.state() == SessionState::Failed {
            completion.resolve(Err(CallError::Transport("session failed".to_string())));
            return;
        }
        if let Err(rejected) = self.cmd_tx.send(Command::Call {
            envelope,
            completion,
        }) {
            // Writer task already gone: resolve inline.
            if let Command::Call { completion, .. } = rejected.0 {
                let error = if self.state() == SessionState::Failed {
                    CallError::Transport("session failed".to_string())
                } else {
                    CallError::Shutdown
                };
                completion.resolve(Err(error));
            }
        }
    }

    /// Cancel all pending calls with `Shutdown` and close the socket.
    pub fn stop(&self) {
        let prev = self
            .state
            .swap(SessionState::Failed as u8, Ordering::AcqRel);
        let drained: Vec<Completion> = self.pending.lock().drain(..).collect();
        for completion in drained {
            completion.resolve(Err(CallError::Shutdown));
        }
        let _ = self.cmd_tx.send(Command::Stop);
        if prev == SessionState::Connected as u8 {
            (self.event_cb)(ClientEvent::Disconnected, "session stopped");
        }
    }

    /// Move to `Failed`, resolve all pending calls with a transport error,
    /// and emit the disconnect event once.
    fn fail(&self, reason: &str) {
        let prev = self
            .state
            .swap(SessionState::Failed as u8, Ordering::AcqRel);
        let drained: Vec<Completion> = self.pending.lock().drain(..).collect();
        for completion in drained {
            completion.resolve(Err(CallError::Transport(reason.to_string())));
        }
        // Unpark the writer so the session task can unwind; it owns the
        // last strong reference once the owner maps let go.
        let _ = self.cmd_tx.send(Command::Stop);
        if prev != SessionState::Failed as u8 {
            debug!(host = %self.host, port = self.port, reason = %reason, "client session failed");
            (self.event_cb)(ClientEvent::Disconnected, reason);
        }
    }

    async fn run(
        self: Arc<Self>,
        handle: Handle,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        connect_timeout: std::time::Duration,
        nodelay: bool,
    ) {
        let addr = format!("{}:{}", self.host, self.port);
        let stream =
            match tokio::time::timeout(connect_timeout, TcpStream::connect(addr.as_str())).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    self.fail(&format!("connect failed: {e}"));
                    Self::drain_commands(&mut cmd_rx);
                    return;
                }
                Err(_) => {
                    self.fail("connect timed out");
                    Self::drain_commands(&mut cmd_rx);
                    return;
                }
            };
        if let Err(e) = stream.set_nodelay(nodelay) {
            debug!(addr = %addr, error = %e, "set_nodelay failed");
        }

        // stop() may have raced the connect; if so, just drop the socket.
        if self
            .state
            .compare_exchange(
                SessionState::Connecting as u8,
                SessionState::Connected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            Self::drain_commands(&mut cmd_rx);
            return;
        }
        debug!(addr = %addr, version = self.version, "client session connected");
        (self.event_cb)(ClientEvent::Connected, &addr);

        let (read_half, mut write_half) = stream.into_split();
        let reader = Arc::clone(&self);
        handle.spawn(async move {
            reader.read_loop(read_half).await;
        });

        // This loop is the session's write strand: one request at a time,
        // queued before it is written so the response can never outrun it.
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Call {
                    envelope,
                    completion,
                } => {
                    if self.state() == SessionState::Failed {
                        completion
                            .resolve(Err(CallError::Transport("session failed".to_string())));
                        continue;
                    }
                    self.pending.lock().push_back(completion);
                    let written = if self.version == 0 {
                        frame::write_v0(&mut write_half, &envelope).await
                    } else {
                        frame::write_v1(&mut write_half, &envelope).await
                    };
                    if let Err(e) = written {
                        self.fail(&format!("write error: {e}"));
                        break;
                    }
                }
                Command::Stop => break,
            }
        }
        Self::drain_commands(&mut cmd_rx);
        // Dropping the write half shuts the send direction down; the reader
        // unwinds on the resulting EOF.
    }

    async fn read_loop(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        loop {
            let read = if self.version == 0 {
                frame::read_v0(&mut read_half).await
            } else {
                frame::read_v1(&mut read_half, self.max_frame_size).await
            };
            let payload = match read {
                Ok(payload) => payload,
                Err(frame::FrameError::Closed) => {
                    self.fail("connection closed by peer");
                    return;
                }
                Err(e) if e.is_decode() => {
                    warn!(host = %self.host, error = %e, "closing session on decode error");
                    if let Some(completion) = self.pending.lock().pop_front() {
                        completion.resolve(Err(CallError::Decode(e.to_string())));
                    }
                    self.fail(&format!("decode error: {e}"));
                    return;
                }
                Err(e) => {
                    self.fail(&format!("read error: {e}"));
                    return;
                }
            };

            match protocol::decode_response(&payload) {
                Ok(envelope) => {
                    let completion = self.pending.lock().pop_front();
                    match completion {
                        Some(completion) => {
                            completion.resolve(Ok(envelope));
                        }
                        None => {
                            debug!(host = %self.host, "response without pending call, dropping");
                        }
                    }
                }
                Err(e) => {
                    warn!(host = %self.host, error = %e, "closing session on decode error");
                    if let Some(completion) = self.pending.lock().pop_front() {
                        completion.resolve(Err(CallError::Decode(e.to_string())));
                    }
                    self.fail(&format!("decode error: {e}"));
                    return;
                }
            }
        }
    }

    fn drain_commands(cmd_rx: &mut mpsc::UnboundedReceiver<Command>) {
        while let Ok(cmd) = cmd_rx.try_recv() {
            if let Command::Call { completion, .. } = cmd {
                completion.resolve(Err(CallError::Transport("session failed".to_string())));
            }
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Stop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn completion_resolves_exactly_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let completion = Completion::new(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(completion.resolve(Err(CallError::Timeout)));
        assert!(!completion.resolve(Err(CallError::Shutdown)));
        assert!(completion.is_resolved());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_completion_fires_shutdown() {
        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        {
            let _completion = Completion::new(move |outcome| {
                *seen2.lock() = Some(outcome);
            });
        }
        let resolved = seen.lock().take();
        match resolved {
            Some(Err(CallError::Shutdown)) => {}
            other => panic!("expected shutdown resolution, got {other:?}"),
        }
    }

    #[test]
    fn clone_does_not_trigger_drop_resolution() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let completion = Completion::new(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        let clone = completion.clone();
        drop(clone);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        completion.resolve(Err(CallError::Timeout));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn session_state_roundtrip() {
        assert_eq!(SessionState::from_u8(0), SessionState::Connecting);
        assert_eq!(SessionState::from_u8(1), SessionState::Connected);
        assert_eq!(SessionState::from_u8(2), SessionState::Failed);
    }
}
