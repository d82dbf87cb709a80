//! Centralized error handling for stream-sentry
//!
//! This module provides a hierarchical error system: each component has its
//! own error enum, and `AppError` unifies them at the application boundary.
//! The mapping from errors to operator alerts lives with the supervisor;
//! one error produces zero or one alert.

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;
