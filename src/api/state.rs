//! Application state for the API server

use crate::Gateway;
use std::sync::Arc;

/// Shared application state accessible to all route handlers
///
/// Cloned for each request; the gateway itself sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The gateway serving uploads and task relay
    pub gateway: Arc<Gateway>,
}

impl AppState {
    /// Create a new AppState
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}
