//! Request and response envelopes.
//!
//! Argument and result values travel as self-describing [`Value`]s so the
//! envelope can be encoded by any [`Serializer`](crate::serialization::Serializer).
//! Typed conversion happens at the edges: [`CallArgs`] on the way in,
//! `serde` deserialization of the result on the way out.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Dynamic value carried in argument lists and results.
pub type Value = serde_json::Value;

/// Well-known [`RemoteFault::kind`] values.
pub mod fault_kind {
    /// No service with the requested name is hosted by the server.
    pub const SERVICE_NOT_FOUND: &str = "ServiceNotFound";
    /// The service exists but has no such method.
    pub const METHOD_NOT_FOUND: &str = "MethodNotFound";
    /// Arity or type of the arguments did not match the method.
    pub const INVALID_ARGUMENTS: &str = "InvalidArguments";
    /// The request frame could not be decoded.
    pub const BAD_REQUEST: &str = "BadRequest";
    /// The result could not be converted to a value.
    pub const SERIALIZATION: &str = "Serialization";
    /// The implementation returned an error.
    pub const APPLICATION: &str = "Application";
    /// The implementation panicked.
    pub const PANIC: &str = "Panic";
}

/// Failure raised by the remote implementation, carried as a normal response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct RemoteFault {
    pub kind: String,
    pub message: String,
}

impl RemoteFault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// An error returned by service code.
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(fault_kind::APPLICATION, message)
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(fault_kind::INVALID_ARGUMENTS, message)
    }
}

/// A single remote invocation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    request_id: u64,
    service_name: String,
    method_name: String,
    parameter_types: Vec<String>,
    arguments: Vec<Value>,
}

impl RpcRequest {
    pub fn new(
        request_id: u64,
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        parameter_types: Vec<String>,
        arguments: Vec<Value>,
    ) -> Self {
        Self {
            request_id,
            service_name: service_name.into(),
            method_name: method_name.into(),
            parameter_types,
            arguments,
        }
    }

    /// Build a request from a typed argument tuple.
    pub fn from_args<A: CallArgs>(
        request_id: u64,
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        args: A,
    ) -> Result<Self> {
        let parameter_types = A::type_names().into_iter().map(str::to_string).collect();
        Ok(Self::new(
            request_id,
            service_name,
            method_name,
            parameter_types,
            args.into_values()?,
        ))
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn parameter_types(&self) -> &[String] {
        &self.parameter_types
    }

    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    /// Take the argument list, consuming the request.
    pub fn into_arguments(self) -> Vec<Value> {
        self.arguments
    }
}

/// Outcome carried by a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcOutcome {
    Success(Value),
    Fault(RemoteFault),
}

/// The answer to one [`RpcRequest`]. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    request_id: u64,
    outcome: RpcOutcome,
}

impl RpcResponse {
    pub fn success(request_id: u64, value: Value) -> Self {
        Self {
            request_id,
            outcome: RpcOutcome::Success(value),
        }
    }

    pub fn fault(request_id: u64, fault: RemoteFault) -> Self {
        Self {
            request_id,
            outcome: RpcOutcome::Fault(fault),
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn outcome(&self) -> &RpcOutcome {
        &self.outcome
    }

    pub fn is_fault(&self) -> bool {
        matches!(self.outcome, RpcOutcome::Fault(_))
    }

    /// Split into the result value or the remote fault.
    pub fn into_result(self) -> std::result::Result<Value, RemoteFault> {
        match self.outcome {
            RpcOutcome::Success(value) => Ok(value),
            RpcOutcome::Fault(fault) => Err(fault),
        }
    }
}

/// Process-local request id source.
///
/// Ids start at 1 and are never reused within the lifetime of the generator.
#[derive(Debug)]
pub struct RequestIdGen {
    next: AtomicU64,
}

impl RequestIdGen {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RequestIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Positional argument list of a remote method.
///
/// Implemented for tuples of up to six elements; a method taking one
/// argument uses `(T,)` and a method taking none uses `()`.
pub trait CallArgs: Sized + Send + 'static {
    /// Number of positional arguments.
    const ARITY: usize;

    /// Type descriptors recorded in [`RpcRequest::parameter_types`].
    fn type_names() -> Vec<&'static str>;

    /// Convert the tuple into positional values.
    fn into_values(self) -> Result<Vec<Value>>;

    /// Rebuild the tuple from positional values on the receiving side.
    fn from_values(values: Vec<Value>) -> std::result::Result<Self, RemoteFault>;
}

fn decode_argument<T: DeserializeOwned>(
    position: usize,
    value: Option<Value>,
) -> std::result::Result<T, RemoteFault> {
    serde_json::from_value(value.unwrap_or(Value::Null)).map_err(|e| {
        RemoteFault::invalid_arguments(format!(
            "argument {} is not a {}: {}",
            position,
            std::any::type_name::<T>(),
            e
        ))
    })
}

macro_rules! impl_call_args {
    ($arity:expr; $($ty:ident $var:ident),*) => {
        impl<$($ty),*> CallArgs for ($($ty,)*)
        where
            $($ty: Serialize + DeserializeOwned + Send + 'static,)*
        {
            const ARITY: usize = $arity;

            fn type_names() -> Vec<&'static str> {
                vec![$(std::any::type_name::<$ty>()),*]
            }

            fn into_values(self) -> Result<Vec<Value>> {
                let ($($var,)*) = self;
                Ok(vec![$(serde_json::to_value($var)?),*])
            }

            #[allow(unused_mut, unused_variables)]
            fn from_values(values: Vec<Value>) -> std::result::Result<Self, RemoteFault> {
                if values.len() != $arity {
                    return Err(RemoteFault::invalid_arguments(format!(
                        "expected {} arguments, got {}",
                        $arity,
                        values.len()
                    )));
                }
                let mut values = values.into_iter();
                let mut position = 0usize;
                Ok(($(
                    {
                        position += 1;
                        decode_argument::<$ty>(position, values.next())?
                    },
                )*))
            }
        }
    };
}

impl_call_args!(0;);
impl_call_args!(1; A a);
impl_call_args!(2; A a, B b);
impl_call_args!(3; A a, B b, C c);
impl_call_args!(4; A a, B b, C c, D d);
impl_call_args!(5; A a, B b, C c, D d, E e);
impl_call_args!(6; A a, B b, C c, D d, E e, F f);
