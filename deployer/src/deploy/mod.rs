//! Deployment orchestration

pub mod bundle;
pub mod fsm;
pub mod orchestrator;
