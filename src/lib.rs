//! stream-sentry: unattended 24/7 playout supervision
//!
//! Drives an external per-item encoder and a long-lived relay, keeps
//! playback progress durable across crashes, publishes a JSON schedule
//! of upcoming and recent items, and mails operators about the
//! conditions they care about.

pub mod config;
pub mod errors;
pub mod playlist;
pub mod schedule;
pub mod services;
pub mod stats;
pub mod supervisor;
pub mod utils;
