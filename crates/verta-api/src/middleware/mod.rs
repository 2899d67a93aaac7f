//! Request middleware

pub mod auth;
pub mod request_log;

pub use auth::{require_bearer, AuthError};
pub use request_log::request_log_middleware;
