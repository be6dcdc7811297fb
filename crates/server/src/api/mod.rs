//! # HTTP API
//!
//! Route groups mounted under `/api/v1`.

pub mod channel;
pub mod error;
pub mod groups;
pub mod sessions;

pub use error::ApiError;
