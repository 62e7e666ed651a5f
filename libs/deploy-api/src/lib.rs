//! HTTP API models shared by the sitedeploy front door and its callers.

pub mod models;
