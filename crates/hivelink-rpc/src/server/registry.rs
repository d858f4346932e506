// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Method handler table for service servers.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Handler for one named method.
///
/// Returns `Ok((ret_state, response_bytes))` when the method executed, or
/// `Err(description)` when it failed. Failures are carried back to the
/// caller in the response header; they do not terminate the session.
///
/// Handlers run synchronously on the session they were called from: a
/// blocking handler stalls its own session but no other.
pub trait MethodHandler: Send + Sync + 'static {
    /// Process a request payload.
    fn handle(&self, payload: &[u8]) -> Result<(i32, Vec<u8>), String>;
}

impl<F> MethodHandler for F
where
    F: Fn(&[u8]) -> Result<(i32, Vec<u8>), String> + Send + Sync + 'static,
{
    fn handle(&self, payload: &[u8]) -> Result<(i32, Vec<u8>), String> {
        self(payload)
    }
}

/// Dispatch outcome for a single request.
pub(crate) enum Dispatch {
    /// Handler ran
    Executed { ret_state: i32, payload: Vec<u8> },
    /// Handler returned an error
    HandlerFailed { error: String },
    /// No handler registered under the requested name
    UnknownMethod,
}

/// Mutable, shared table of method handlers.
///
/// Methods can be added and removed while the server is accepting calls.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: Arc<RwLock<HashMap<String, Arc<dyn MethodHandler>>>>,
}

impl MethodTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler of the same name.
    pub fn add<H: MethodHandler>(&self, method_name: &str, handler: H) {
        self.methods
            .write()
            .insert(method_name.to_string(), Arc::new(handler));
    }

    /// Remove a handler. Returns whether one was registered.
    pub fn remove(&self, method_name: &str) -> bool {
        self.methods.write().remove(method_name).is_some()
    }

    /// Names of all registered methods.
    pub fn method_names(&self) -> Vec<String> {
        self.methods.read().keys().cloned().collect()
    }

    pub(crate) fn dispatch(&self, method_name: &str, payload: &[u8]) -> Dispatch {
        let handler = self.methods.read().get(method_name).cloned();
        match handler {
            Some(handler) => match handler.handle(payload) {
                Ok((ret_state, payload)) => Dispatch::Executed { ret_state, payload },
                Err(error) => Dispatch::HandlerFailed { error },
            },
            None => Dispatch::UnknownMethod,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_handler_executes() {
        let table = MethodTable::new();
        table.add("echo", |payload: &[u8]| Ok((7, payload.to_vec())));

        match table.dispatch("echo", b"hi") {
            Dispatch::Executed { ret_state, payload } => {
                assert_eq!(ret_state, 7);
                assert_eq!(payload, b"hi");
            }
            _ => panic!("expected execution"),
        }
    }

    #[test]
    fn handler_failure_is_not_fatal() {
        let table = MethodTable::new();
        table.add("flaky", |_: &[u8]| Err("bad input".to_string()));

        match table.dispatch("flaky", b"") {
            Dispatch::HandlerFailed { error } => assert_eq!(error, "bad input"),
            _ => panic!("expected handler failure"),
        }
    }

    #[test]
    fn unknown_method() {
        let table = MethodTable::new();
        assert!(matches!(
            table.dispatch("missing", b""),
            Dispatch::UnknownMethod
        ));
    }

    #[test]
    fn add_remove_and_list() {
        let table = MethodTable::new();
        table.add("a", |_: &[u8]| Ok((0, Vec::new())));
        table.add("b", |_: &[u8]| Ok((0, Vec::new())));

        let mut names = table.method_names();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);

        assert!(table.remove("a"));
        assert!(!table.remove("a"));
        assert!(matches!(table.dispatch("a", b""), Dispatch::UnknownMethod));
    }

    #[test]
    fn replacing_a_handler_takes_effect() {
        let table = MethodTable::new();
        table.add("m", |_: &[u8]| Ok((1, Vec::new())));
        table.add("m", |_: &[u8]| Ok((2, Vec::new())));
        match table.dispatch("m", b"") {
            Dispatch::Executed { ret_state, .. } => assert_eq!(ret_state, 2),
            _ => panic!("expected execution"),
        }
    }
}
