// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-scoped I/O runtime.
//!
//! All sessions — server and client, across every service object — are
//! driven by one shared runtime so the process thread count stays bounded.
//! The embedding program constructs it explicitly and stops it explicitly;
//! there is no on-demand global.
//!
//! Each session gets its own task (or task pair), which serializes all
//! handlers for that session regardless of how many worker threads drive
//! the runtime.

use crate::config::RpcConfig;
use crate::error::{RpcError, RpcResult};
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

/// Shared event loop for all RPC sessions.
pub struct RpcRuntime {
    runtime: Option<Runtime>,
}

impl RpcRuntime {
    /// Build a runtime with the configured worker thread count.
    pub fn new(config: &RpcConfig) -> RpcResult<Self> {
        config.validate().map_err(RpcError::Config)?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("hivelink-rpc-io")
            .enable_io()
            .enable_time()
            .build()?;
        debug!(workers = config.worker_threads, "rpc runtime started");
        Ok(Self {
            runtime: Some(runtime),
        })
    }

    /// Handle for spawning session tasks.
    ///
    /// Handles stay valid until [`RpcRuntime::stop`]; tasks spawned on a
    /// stopped runtime are dropped.
    pub fn handle(&self) -> Handle {
        // runtime is Some until stop() consumes self
        self.runtime
            .as_ref()
            .map(|rt| rt.handle().clone())
            .unwrap_or_else(Handle::current)
    }

    /// Stop the runtime, giving in-flight session handlers a short grace
    /// period to finish their current step.
    pub fn stop(mut self) {
        if let Some(rt) = self.runtime.take() {
            debug!("rpc runtime stopping");
            rt.shutdown_timeout(Duration::from_secs(1));
        }
    }
}

impl Drop for RpcRuntime {
    fn drop(&mut self) {
        if let Some(rt) = self.runtime.take() {
            rt.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_spawns_and_stops() {
        let rt = RpcRuntime::new(&RpcConfig::default()).unwrap();
        let handle = rt.handle();
        let (tx, rx) = std::sync::mpsc::channel();
        handle.spawn(async move {
            let _ = tx.send(41 + 1);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        rt.stop();
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = RpcConfig::default().with_worker_threads(0);
        assert!(matches!(
            RpcRuntime::new(&config),
            Err(RpcError::Config(_))
        ));
    }
}
