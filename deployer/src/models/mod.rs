//! Data models

pub mod deployment;
pub mod job;
pub mod site;
