//! # Jobline
//!
//! Event-driven job orchestration: connectors turn external signals into
//! durable events, subscriptions route events to jobs, and a competitive
//! scheduler runs job executions on pluggable runner backends.

pub mod config;
pub mod connectors;
pub mod crypto;
pub mod db;
pub mod driver;
pub mod error;
pub mod handlers;
pub mod models;
pub mod output;
pub mod repositories;
pub mod runners;
pub mod scheduler;
pub mod scope;
pub mod server;
pub mod telemetry;

pub use migration;
