//! Payload serializers.
//!
//! A [`Serializer`] turns request and response envelopes into frame payloads
//! and back. Both ends of a connection must use the same serializer; the
//! choice is made once, in [`RpcConfig::serializer`](crate::config::RpcConfig).

use crate::error::{Result, RpcError};
use crate::message::{RpcRequest, RpcResponse};
use std::sync::Arc;

/// Envelope codec shared by the correlator and the receive server.
pub trait Serializer: Send + Sync + 'static {
    /// Short name used in configuration and error messages.
    fn name(&self) -> &'static str;

    fn encode_request(&self, request: &RpcRequest) -> Result<Vec<u8>>;

    fn decode_request(&self, bytes: &[u8]) -> Result<RpcRequest>;

    fn encode_response(&self, response: &RpcResponse) -> Result<Vec<u8>>;

    fn decode_response(&self, bytes: &[u8]) -> Result<RpcResponse>;
}

/// UTF-8 JSON payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_request(&self, request: &RpcRequest) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(request)?)
    }

    fn decode_request(&self, bytes: &[u8]) -> Result<RpcRequest> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode_response(&self, response: &RpcResponse) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(response)?)
    }

    fn decode_response(&self, bytes: &[u8]) -> Result<RpcResponse> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// MessagePack payloads with named struct fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgpackSerializer;

impl Serializer for MsgpackSerializer {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode_request(&self, request: &RpcRequest) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(request)?)
    }

    fn decode_request(&self, bytes: &[u8]) -> Result<RpcRequest> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    fn encode_response(&self, response: &RpcResponse) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(response)?)
    }

    fn decode_response(&self, bytes: &[u8]) -> Result<RpcResponse> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Look up a serializer by its configured name.
pub fn serializer_by_name(name: &str) -> Result<Arc<dyn Serializer>> {
    match name {
        "json" => Ok(Arc::new(JsonSerializer)),
        "msgpack" => Ok(Arc::new(MsgpackSerializer)),
        other => Err(RpcError::Config {
            message: format!("Unknown serializer: {}", other),
        }),
    }
}
