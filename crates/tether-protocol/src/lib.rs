//! Wire protocol types for the tether runtime gateway.
//!
//! Two boundaries share these types:
//!
//! - **Runtime boundary**: newline-delimited JSON-RPC-shaped messages exchanged
//!   with the agent-runtime subprocess over stdin/stdout ([`rpc`]).
//! - **Stream boundary**: persisted runtime events and their externally visible
//!   stream-event representation delivered to replay/live subscribers
//!   ([`events`]).

pub mod events;
pub mod rpc;

pub use events::{
    APPROVAL_REQUEST_METHODS, APPROVAL_RESOLVED_METHOD, RuntimeEvent, StreamEvent, StreamEventKind,
};
pub use rpc::{ParseError, RequestId, RpcError, RpcMessage, error_codes};
