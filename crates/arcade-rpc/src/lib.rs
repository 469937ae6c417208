//! Wire-level agent/control-plane RPC: message shapes, the agent-side
//! client with reconnect supervision, and the control-plane-side axum
//! server. Sits on top of `arcade-core`'s business logic and `arcade-db`'s
//! persistence; has no opinions of its own about scheduling or retries.

pub mod client;
pub mod proto;
pub mod server;

pub use client::{ConnState, RpcClient, RpcError, normalize_addr};
pub use server::{AppState, build_router, serve};
