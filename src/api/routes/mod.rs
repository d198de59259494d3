//! Route handlers for the REST API
//!
//! Handlers are organized by domain:
//! - [`uploads`] - chunk, merge and small-file uploads
//! - [`tasks`] - synthesis task relay
//! - [`artifacts`] - serving stored uploads
//! - [`system`] - health and OpenAPI

use serde::{Deserialize, Serialize};

mod artifacts;
mod system;
mod tasks;
mod uploads;

pub use artifacts::*;
pub use system::*;
pub use tasks::*;
pub use uploads::*;

/// Query parameters for GET /api/query-task
#[derive(Debug, Deserialize, Serialize, utoipa::IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct QueryTaskParams {
    /// Task to look up
    pub task_id: Option<String>,
}
