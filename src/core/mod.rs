//! Core engine: types, naming, graph building, state, planning, scheduling.

pub mod config;
pub mod error;
pub mod executor;
pub mod naming;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod state;
pub mod types;
