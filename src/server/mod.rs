//! Control-plane adapters over the core subsystems.
//!
//! [`ops`] holds the adapter-neutral operations; [`http`] and [`mcp`] are
//! thin translations onto axum and stdio JSON-RPC respectively.

pub mod http;
pub mod mcp;
pub mod ops;

pub use ops::AppContext;
