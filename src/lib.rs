pub mod agent;
pub mod config;
pub mod export;
pub mod processor;
pub mod sink;
pub mod tracer;
