//! Payload serialization.
//!
//! The core only needs a serializer that round-trips requests and responses,
//! including failure outcomes. JSON is the default and the only format the
//! crate ships; other formats plug in through [`Codec`].

use std::sync::Arc;

use bytes::Bytes;

use crate::protocol::{RpcRequest, RpcResponse};
use crate::Result;

/// Encodes and decodes the two wire message kinds.
pub trait Codec: Send + Sync {
    /// Value stored in the envelope's `content_type`.
    fn content_type(&self) -> &'static str;

    fn encode_request(&self, req: &RpcRequest) -> Result<Bytes>;

    fn decode_request(&self, payload: &[u8]) -> Result<RpcRequest>;

    fn encode_response(&self, resp: &RpcResponse) -> Result<Bytes>;

    fn decode_response(&self, payload: &[u8]) -> Result<RpcResponse>;
}

/// Shared codec pointer.
pub type CodecPtr = Arc<dyn Codec>;

/// `serde_json` codec, content type `application/json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn shared() -> CodecPtr {
        Arc::new(JsonCodec)
    }
}

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode_request(&self, req: &RpcRequest) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(req)?))
    }

    fn decode_request(&self, payload: &[u8]) -> Result<RpcRequest> {
        Ok(serde_json::from_slice(payload)?)
    }

    fn encode_response(&self, resp: &RpcResponse) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(resp)?))
    }

    fn decode_response(&self, payload: &[u8]) -> Result<RpcResponse> {
        Ok(serde_json::from_slice(payload)?)
    }
}
