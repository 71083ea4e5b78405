pub mod bounded_call;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod idempotency;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod types;

// Application use cases and the adapters behind their ports
pub mod app;
pub mod infra;
