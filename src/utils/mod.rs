//! Small shared helpers

pub mod argv;
pub mod time_format;

pub use argv::split_args;
pub use time_format::{format_hms, format_span};
