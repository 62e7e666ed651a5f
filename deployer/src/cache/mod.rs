//! Caches

pub mod project;
