pub mod config;
pub mod http;
pub mod jobs;
pub mod sidecar;
pub mod telemetry;
