//! RPC surface of the orchestrator: JSON over HTTP

pub mod error;
pub mod handlers;
pub mod state;

pub use error::{ApiError, ApiResult, ErrorBody};
pub use handlers::{create_router, OperationStatus};
pub use state::AppState;
