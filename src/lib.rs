//! Proposal Pilot: admission control, batch scheduling, and draft composition
//! for incoming work opportunities.

pub mod admission;
pub mod composer;
pub mod config;
pub mod error;
pub mod llm;
pub mod logging;
pub mod opportunities;
pub mod scheduler;
pub mod store;
