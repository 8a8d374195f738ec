//! REST and Server-Sent Events API

pub mod error;
pub mod routes;
pub mod server;

pub use error::{ApiError, ErrorResponse};
pub use routes::{AppState, create_routes};
pub use server::{build_router, start_server};
