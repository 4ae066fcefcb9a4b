//! Supervised agent-runtime gateway.
//!
//! Tether bridges an HTTP/WebSocket surface to a long-lived agent-runtime
//! subprocess speaking line-delimited JSON-RPC over stdin/stdout. The
//! supervisor restarts the runtime on crash with exponential backoff, every
//! runtime notification is appended to a durable SQLite event log, and
//! WebSocket subscribers replay the log past a cursor before switching to
//! live delivery with no gap and no duplicate.

pub mod api;
pub mod config;
pub mod gateway;
pub mod hub;
pub mod process;
pub mod rpc;
pub mod store;
