//! JSON-over-HTTP RPC plumbing shared by both roles.

pub mod client;
pub mod server;

pub use client::{endpoint, RpcClient, RpcError};
pub use server::{bind_addr, serve, RpcServer};
