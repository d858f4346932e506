// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Listening socket and accept loop.
//!
//! The acceptor never extends a session's lifetime: its list holds weak
//! handles only, and each session's shutdown callback removes the matching
//! entry when the session terminates on its own. Stopping the acceptor
//! stops accepting and asks every live session to stop; the sessions then
//! unwind through their normal teardown path.

use crate::server::session::{ServerSession, SessionContext};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub(crate) struct Acceptor {
    local_addr: SocketAddr,
    sessions: Mutex<Vec<Weak<ServerSession>>>,
    stop_notify: Notify,
    stopped: AtomicBool,
}

impl Acceptor {
    pub(crate) fn new(local_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            local_addr,
            sessions: Mutex::new(Vec::new()),
            stop_notify: Notify::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Actual bound port (resolves an ephemeral bind).
    pub(crate) fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Number of live sessions; dead entries are purged as a side effect.
    pub(crate) fn connection_count(&self) -> usize {
        let mut sessions = self.sessions.lock();
        sessions.retain(|weak| weak.upgrade().is_some());
        sessions.len()
    }

    /// Remove one session's entry (called from its shutdown callback).
    pub(crate) fn purge(&self, session: &Arc<ServerSession>) {
        self.sessions.lock().retain(|weak| match weak.upgrade() {
            Some(live) => !Arc::ptr_eq(&live, session),
            None => false,
        });
    }

    /// Stop accepting and ask every live session to stop.
    pub(crate) fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_notify.notify_one();

        // Collect strong refs under the lock, call into sessions outside it
        let live: Vec<Arc<ServerSession>> = self
            .sessions
            .lock()
            .iter()
            .filter_map(|weak| weak.upgrade())
            .collect();
        for session in live {
            session.stop();
        }
    }

    /// Spawn the accept loop for `version` sessions.
    ///
    /// Takes a bound std listener (already non-blocking) so that creation
    /// never needs to block on the runtime; registration with the reactor
    /// happens inside the spawned task.
    pub(crate) fn start(
        self: Arc<Self>,
        handle: &Handle,
        listener: std::net::TcpListener,
        version: u8,
        ctx: Arc<SessionContext>,
        nodelay: bool,
    ) {
        let acceptor = self;
        let task_handle = handle.clone();
        handle.spawn(async move {
            let listener = match TcpListener::from_std(listener) {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(error = %e, "failed to register listener with the runtime");
                    return;
                }
            };
            acceptor
                .accept_loop(task_handle, listener, version, ctx, nodelay)
                .await;
        });
    }

    async fn accept_loop(
        self: Arc<Self>,
        handle: Handle,
        listener: TcpListener,
        version: u8,
        ctx: Arc<SessionContext>,
        nodelay: bool,
    ) {
        info!(port = self.local_port(), version, "service accepting connections");
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = self.stop_notify.notified() => {
                    info!(port = self.local_port(), "acceptor stopping");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed, shutting down listener");
                        return;
                    }
                },
            };
            if self.stopped.load(Ordering::Acquire) {
                return;
            }

            if let Err(e) = stream.set_nodelay(nodelay) {
                debug!(peer = %peer_addr, error = %e, "set_nodelay failed");
            }

            // Weak entry first, then start: the session owns itself via its
            // task and purges the entry through this callback on teardown.
            let session = ServerSession::new(peer_addr, version);
            self.sessions.lock().push(Arc::downgrade(&session));

            let weak_acceptor = Arc::downgrade(&self);
            let shutdown_cb: Arc<dyn Fn(&Arc<ServerSession>) + Send + Sync> =
                Arc::new(move |ended: &Arc<ServerSession>| {
                    if let Some(acceptor) = weak_acceptor.upgrade() {
                        acceptor.purge(ended);
                    }
                });

            session.start(&handle, stream, Arc::clone(&ctx), shutdown_cb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_count_purges_dead_entries() {
        let acceptor = Acceptor::new("127.0.0.1:0".parse().unwrap());
        let session = ServerSession::new("127.0.0.1:1".parse().unwrap(), 1);
        acceptor.sessions.lock().push(Arc::downgrade(&session));
        assert_eq!(acceptor.connection_count(), 1);

        drop(session);
        assert_eq!(acceptor.connection_count(), 0);
    }

    #[test]
    fn purge_removes_only_the_matching_session() {
        let acceptor = Acceptor::new("127.0.0.1:0".parse().unwrap());
        let a = ServerSession::new("127.0.0.1:1".parse().unwrap(), 1);
        let b = ServerSession::new("127.0.0.1:2".parse().unwrap(), 1);
        acceptor.sessions.lock().push(Arc::downgrade(&a));
        acceptor.sessions.lock().push(Arc::downgrade(&b));

        acceptor.purge(&a);
        assert_eq!(acceptor.connection_count(), 1);
    }

    #[test]
    fn stop_is_idempotent() {
        let acceptor = Acceptor::new("127.0.0.1:0".parse().unwrap());
        acceptor.stop();
        acceptor.stop();
        assert!(acceptor.stopped.load(Ordering::Acquire));
    }
}
