//! Process wiring and lifecycle

pub mod options;
pub mod run;
pub mod settings;
pub mod state;
