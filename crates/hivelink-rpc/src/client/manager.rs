// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client session factory and shutdown authority.
//!
//! One manager per process: it carries the runtime handle all client
//! sessions share, so the I/O thread count stays bounded no matter how
//! many service clients exist. The manager tracks sessions weakly; each
//! session is kept alive by its owners and its own tasks, never by the
//! manager.

use crate::client::session::{ClientSession, SessionEventCallback};
use crate::config::RpcConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::debug;

/// Factory for [`ClientSession`]s on a shared runtime.
pub struct ClientManager {
    handle: Handle,
    config: RpcConfig,
    sessions: Mutex<Vec<Weak<ClientSession>>>,
    stopped: AtomicBool,
}

impl ClientManager {
    /// Create a manager driving sessions on `handle`.
    pub fn new(handle: Handle, config: RpcConfig) -> Arc<Self> {
        Arc::new(Self {
            handle,
            config,
            sessions: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Create a session to `host:port` speaking `version`.
    ///
    /// Returns `None` once the manager is stopped. The connect proceeds in
    /// the background; the session is usable immediately.
    pub fn create_client(
        &self,
        version: u8,
        host: &str,
        port: u16,
        event_cb: SessionEventCallback,
    ) -> Option<Arc<ClientSession>> {
        if self.is_stopped() {
            return None;
        }
        let session = ClientSession::connect(&self.handle, &self.config, version, host, port, event_cb);
        let mut sessions = self.sessions.lock();
        sessions.retain(|weak| weak.upgrade().is_some());
        sessions.push(Arc::downgrade(&session));
        Some(session)
    }

    /// Whether [`ClientManager::stop`] has run.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Number of live sessions (dead entries purged as a side effect).
    pub fn session_count(&self) -> usize {
        let mut sessions = self.sessions.lock();
        sessions.retain(|weak| weak.upgrade().is_some());
        sessions.len()
    }

    /// Stop every live session and refuse new creations.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("client manager stopping");
        // Strong refs collected under the lock, sessions stopped outside it.
        let live: Vec<Arc<ClientSession>> = self
            .sessions
            .lock()
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        for session in live {
            session.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RpcRuntime;
    use crate::types::SessionState;

    fn noop_event_cb() -> SessionEventCallback {
        Arc::new(|_, _| {})
    }

    #[test]
    fn stopped_manager_creates_nothing() {
        let runtime = RpcRuntime::new(&RpcConfig::default()).unwrap();
        let manager = ClientManager::new(runtime.handle(), RpcConfig::default());
        manager.stop();
        assert!(manager
            .create_client(1, "127.0.0.1", 1, noop_event_cb())
            .is_none());
        runtime.stop();
    }

    #[test]
    fn stop_fails_live_sessions() {
        let runtime = RpcRuntime::new(&RpcConfig::default()).unwrap();
        let manager = ClientManager::new(runtime.handle(), RpcConfig::default());

        // Port 1 is never listening; the session heads for Failed on its
        // own, but stop() must force the terminal state immediately.
        let session = manager
            .create_client(1, "127.0.0.1", 1, noop_event_cb())
            .unwrap();
        manager.stop();
        assert_eq!(session.state(), SessionState::Failed);
        assert!(manager.is_stopped());
        runtime.stop();
    }

    #[test]
    fn session_table_drops_dead_entries() {
        let runtime = RpcRuntime::new(&RpcConfig::default()).unwrap();
        let manager = ClientManager::new(runtime.handle(), RpcConfig::default());
        let session = manager
            .create_client(1, "127.0.0.1", 1, noop_event_cb())
            .unwrap();
        assert_eq!(manager.session_count(), 1);
        session.stop();
        drop(session);
        // The session task may still hold the Arc briefly while unwinding.
        for _ in 0..50 {
            if manager.session_count() == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(manager.session_count(), 0);
        runtime.stop();
    }
}
