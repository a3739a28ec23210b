//! HTTP collaborator contract.
//!
//! The core never talks to the network itself; a loader is handed
//! something that can fetch JSON at an endpoint with arguments.
//! Transport failures surface as [`Error::Transport`]; there is no
//! retry here — callers retry the whole load.
//!
//! [`Error::Transport`]: crate::errors::Error::Transport

use crate::errors::Result;
use std::collections::BTreeMap;

/// Query arguments, in a stable order.
pub type HttpArgs = BTreeMap<String, String>;

/// One GET request: endpoint plus arguments.
#[derive(Debug, Clone)]
pub struct ApiArg {
    pub endpoint: String,
    pub args: HttpArgs,
}

impl ApiArg {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            args: HttpArgs::new(),
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

/// Fetch JSON at an endpoint. Response parsing is by key; unknown keys
/// are ignored by the callers.
pub trait ApiClient: Send + Sync {
    fn get(&self, arg: &ApiArg) -> Result<serde_json::Value>;
}
