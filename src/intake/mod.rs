//! The application intake state machine: domain types, the per-user form
//! session, and the engine that drives both against the store.

pub mod engine;
pub mod session;
pub mod types;
