// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Configuration for the service RPC layer.
//!
//! # Example
//!
//! ```
//! use hivelink_rpc::RpcConfig;
//! use std::time::Duration;
//!
//! let config = RpcConfig::default()
//!     .with_max_frame_size(4 * 1024 * 1024)
//!     .with_connect_timeout(Duration::from_secs(2));
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

/// Tuning knobs shared by servers, clients and the I/O runtime.
#[derive(Clone, Debug)]
pub struct RpcConfig {
    /// Maximum v1 frame payload size in bytes (anti-OOM protection).
    ///
    /// Frames larger than this are rejected and the session is closed.
    /// The v0 protocol has a fixed 64 KiB message limit instead.
    pub max_frame_size: usize,

    /// Timeout for outbound TCP connects.
    pub connect_timeout: Duration,

    /// Enable TCP_NODELAY on all sessions.
    pub nodelay: bool,

    /// Worker threads for the I/O runtime.
    pub worker_threads: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024, // 16 MB
            connect_timeout: Duration::from_secs(5),
            nodelay: true,
            worker_threads: 2,
        }
    }
}

impl RpcConfig {
    /// Builder: set the maximum v1 frame size.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Builder: set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builder: set TCP_NODELAY.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Builder: set the I/O runtime thread count.
    pub fn with_worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    /// Validate configuration, returning an error message if invalid.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_frame_size == 0 {
            return Err("max_frame_size must be > 0");
        }
        if self.max_frame_size > 1024 * 1024 * 1024 {
            return Err("max_frame_size too large (> 1 GB)");
        }
        if self.connect_timeout.is_zero() {
            return Err("connect_timeout must be > 0");
        }
        if self.worker_threads == 0 {
            return Err("worker_threads must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = RpcConfig::default();
        assert_eq!(config.max_frame_size, 16 * 1024 * 1024);
        assert!(config.nodelay);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_methods() {
        let config = RpcConfig::default()
            .with_max_frame_size(1024)
            .with_connect_timeout(Duration::from_millis(250))
            .with_nodelay(false)
            .with_worker_threads(4);
        assert_eq!(config.max_frame_size, 1024);
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert!(!config.nodelay);
        assert_eq!(config.worker_threads, 4);
    }

    #[test]
    fn validation_errors() {
        assert!(RpcConfig::default()
            .with_max_frame_size(0)
            .validate()
            .is_err());
        assert!(RpcConfig::default()
            .with_max_frame_size(2 * 1024 * 1024 * 1024)
            .validate()
            .is_err());
        assert!(RpcConfig::default()
            .with_connect_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(RpcConfig::default()
            .with_worker_threads(0)
            .validate()
            .is_err());
    }
}
