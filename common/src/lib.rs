// Shared modules for the benchmark runner
pub mod config;
pub mod engine;
pub mod metrics;
pub mod utils;
