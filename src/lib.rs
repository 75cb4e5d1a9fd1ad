//! Mesh TCP latency probing.
//!
//! A control plane dispatches full-mesh probe tasks to agents, agents dial
//! their peers and report handshake delays, and the control plane folds the
//! per-pair sample windows into persisted average delays.

pub mod agent;
pub mod config;
pub mod control;
pub mod export;
pub mod migrate;
pub mod proto;
pub mod rpc;
pub mod store;
