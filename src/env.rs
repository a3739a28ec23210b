//! The explicit environment handle.
//!
//! Every operation that touches a collaborator takes one of these;
//! there is no process-wide mutable state. An [`Env`] is shared
//! immutably between concurrent user loads.

use crate::api::ApiClient;
use crate::store::LocalDb;
use std::sync::Arc;

/// Shared handles to the HTTP collaborator and the local blob store.
#[derive(Clone)]
pub struct Env {
    pub api: Arc<dyn ApiClient>,
    pub db: Arc<dyn LocalDb>,
}

impl Env {
    pub fn new(api: Arc<dyn ApiClient>, db: Arc<dyn LocalDb>) -> Self {
        Self { api, db }
    }
}
