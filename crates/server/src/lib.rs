//! HTTP surface and background jobs for the depot build CDN.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod requestlog;
pub mod routes;
pub mod state;
pub mod stream;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
