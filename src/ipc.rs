//! Named-method dispatch for remote requests.

use serde_json::Value;
use tracing::{debug, warn};

pub mod protocol;

pub use protocol::{Request, Response};

use crate::common::collections::HashMap;
use crate::sys::host::Host;

pub type MethodHandler = Box<dyn Fn(&mut dyn Host, &Value) -> Response>;

#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<String, MethodHandler>,
}

impl MethodRegistry {
    pub fn new() -> Self { MethodRegistry::default() }

    pub fn register_method(&mut self, name: &str, handler: MethodHandler) {
        if self.methods.insert(name.to_string(), handler).is_some() {
            warn!(method = name, "replacing existing method handler");
        }
    }

    pub fn unregister_method(&mut self, name: &str) -> bool { self.methods.remove(name).is_some() }

    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn call(&self, host: &mut dyn Host, method: &str, data: &Value) -> Response {
        match self.methods.get(method) {
            Some(handler) => handler(host, data),
            None => Response::error(format!("no such method: {method}")),
        }
    }

    pub fn handle_request(&self, host: &mut dyn Host, request: &Request) -> Response {
        debug!(method = %request.method, "handling request");
        self.call(host, &request.method, &request.data)
    }
}

/// Reads `data[field]` as an unsigned 64-bit integer.
pub fn json_get_uint64(data: &Value, field: &str) -> Option<u64> { data.get(field)?.as_u64() }
