//! Sitedeploy library
//!
//! Deployment orchestration for static site bundles: a persistent priority
//! queue, hosting provider adapters, the orchestrator that drives one
//! deployment attempt, and the worker loops and HTTP front door around them.

pub mod app;
pub mod cache;
pub mod deploy;
pub mod errors;
pub mod http;
pub mod logs;
pub mod models;
pub mod providers;
pub mod queue;
pub mod server;
pub mod store;
pub mod utils;
pub mod workers;
