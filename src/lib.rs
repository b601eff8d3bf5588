pub mod align;
pub mod batch;
pub mod config;
pub mod diagnostic;
pub mod encoder;
pub mod events;
pub mod ingest;
pub mod report;
pub mod running;
pub mod signal;
pub mod stats;

/// Application name for XDG paths
pub const APP_NAME: &str = "runfiber";
