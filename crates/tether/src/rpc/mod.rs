//! JSON-RPC connection to the runtime subprocess.

pub mod client;

pub use client::{ClientError, ClientEvent, RpcClient};
