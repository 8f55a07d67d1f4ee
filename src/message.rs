//! Service definition
//!
//! Traits to define the behaviour of messages for services
use crate::Service;
use std::fmt::Debug;

pub use crate::pattern::{
    bidi_streaming::{BidiStreaming, BidiStreamingMsg},
    client_streaming::{ClientStreaming, ClientStreamingMsg},
    rpc::{Rpc, RpcMsg},
    server_streaming::{ServerStreaming, ServerStreamingMsg},
};

/// Declares the interaction pattern for a message and a service.
///
/// For each server and each message, only one interaction pattern can be defined.
pub trait Msg<S: Service>: Into<S::Req> + TryFrom<S::Req> + Send + 'static {
    /// The interaction pattern for this message with this service.
    type Pattern: InteractionPattern;
}

/// The shape of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    /// One request, one response
    Unary,
    /// A stream of requests, one response
    ClientStreaming,
    /// One request, a stream of responses
    ServerStreaming,
    /// A stream of requests and a stream of responses
    BidiStreaming,
}

/// Trait defining interaction pattern.
///
/// Currently there are 4 patterns:
/// - [Rpc]: 1 request, 1 response
/// - [ClientStreaming]: 1 request, stream of updates, 1 response
/// - [ServerStreaming]: 1 request, stream of responses
/// - [BidiStreaming]: 1 request, stream of updates, stream of responses
pub trait InteractionPattern: Debug + Clone + Send + Sync + 'static {
    /// The call shape of this pattern
    const SHAPE: CallShape;
}
