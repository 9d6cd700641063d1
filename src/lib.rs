//! tokenwatch - USB security token monitoring library
//!
//! This library exposes the token monitor, the agent and watchdog loops
//! and their collaborators so they can be driven from the binary or from
//! tests.

pub mod bus;
pub mod cli;
pub mod constants;
pub mod control;
pub mod daemon;
pub mod error;
pub mod models;
pub mod monitor;
pub mod output;
pub mod watchdog;
