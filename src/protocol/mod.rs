//! Wire protocol: what travels inside an envelope's payload.
//!
//! Routing (destination, reply address, correlation id) is carried by the
//! envelope metadata, never by these types.
mod codec;
mod message;

pub use codec::{Codec, CodecPtr, JsonCodec};
pub use message::{CallArgs, Outcome, RemoteFailure, RpcRequest, RpcResponse};
