//! A streaming greeter rpc with a latency interceptor and a resilient channel
//!
//! The crate is built around the four interaction patterns of a multiplexed rpc
//! transport: rpc (one request, one response), client streaming, server streaming
//! and bidirectional streaming. On top of that it provides
//!
//! - [`interceptor`]: middleware that wraps every call regardless of its pattern,
//!   most importantly the [`LatencyInterceptor`](interceptor::LatencyInterceptor).
//! - [`channel`]: a client side channel that applies a retry or hedging policy per
//!   method and carries keep-alive settings down to the transport.
//! - [`greeter`]: the greeter service, its handler and the client demos.
//!
//! # Example
//! ```
//! # async fn example() -> anyhow::Result<()> {
//! use greeter_rpc::{
//!     greeter::{Greet, GreetRequest, Greeter, GreeterService},
//!     interceptor::{LatencyInterceptor, TracingSink},
//!     server::serve,
//!     transport::flume,
//!     RpcClient, RpcServer,
//! };
//!
//! // create a transport channel
//! let (server, client) = flume::channel(1);
//!
//! // serve the greeter, timing every call
//! let server = RpcServer::<GreeterService, _>::new(server);
//! tokio::spawn(serve(server, Greeter::default(), LatencyInterceptor::new(TracingSink), Greeter::handle_rpc_request));
//!
//! // call the service
//! let client = RpcClient::<GreeterService, _>::new(client);
//! let res = client.rpc(Greet(GreetRequest::new("Will"))).await?;
//! assert_eq!(res.message, "Hello Will!");
//! # Ok(())
//! # }
//! ```
#![cfg_attr(greeter_docsrs, feature(doc_cfg))]
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::{Debug, Display};
pub mod channel;
pub mod client;
pub mod context;
pub mod greeter;
pub mod interceptor;
pub mod message;
pub mod pattern;
pub mod resilience;
pub mod server;
pub mod status;
pub mod transport;
pub use client::RpcClient;
pub use server::RpcServer;
pub use status::{Code, Status};

/// Requirements for a RPC message
///
/// Even when just using the mem transport, we require messages to be Serializable and Deserializable.
/// Likewise, even when using the hyper transport, we require messages to be Send.
///
/// This does not seem like a big restriction. If you want a pure memory channel without the possibility
/// to also use the hyper transport, you might want to use a mpsc channel directly.
pub trait RpcMessage: Debug + Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}

impl<T> RpcMessage for T where
    T: Debug + Serialize + DeserializeOwned + Send + Sync + Unpin + 'static
{
}

/// Requirements for an internal error
///
/// All errors have to be Send, Sync and 'static so they can be sent across threads.
/// They also have to be Debug and Display so they can be logged.
///
/// We don't require them to implement [std::error::Error] so we can use
/// anyhow::Error as an error type.
pub trait RpcError: Debug + Display + Into<anyhow::Error> + Send + Sync + Unpin + 'static {}

impl<T> RpcError for T where T: Debug + Display + Into<anyhow::Error> + Send + Sync + Unpin + 'static
{}

/// Request messages know which method they open.
///
/// The method identifier ends up in the [`CallContext`](context::CallContext)
/// of every call and is what channel method configs are matched against.
pub trait RequestMethod {
    /// The method identifier, e.g. `/greet.Greeter/Greet`
    fn method(&self) -> &'static str;
}

/// Response messages that can carry the final status of a call.
///
/// This plays the role of the trailers of a http2 based rpc: a call that is
/// aborted on the server side ends with a status instead of a response.
pub trait StatusResponse: Sized {
    /// Wrap a terminal status into a response message
    fn from_status(status: Status) -> Self;

    /// Split a response message into a regular response or a terminal status
    fn into_result(self) -> Result<Self, Status>;
}

/// A service
///
/// A service has request and response message types. These types have to be the
/// union of all possible request and response types for all interactions with
/// the service.
///
/// Usually you will define an enum for the request and response
/// type, and use the [derive_more](https://crates.io/crates/derive_more) crate to
/// define the conversions between the enum and the actual request and response types.
///
/// To make a message type usable as a request for a service, implement [message::Msg]
/// for it. This is how you define the interaction patterns for each request type.
///
/// Depending on the interaction type, you might need to implement traits that further
/// define details of the interaction.
///
/// A message type can be used for multiple services. E.g. you might have a
/// Status request that is understood by multiple services and returns a
/// standard status response.
pub trait Service: Send + Sync + Debug + Clone + 'static {
    /// Type of request messages
    type Req: RpcMessage + RequestMethod;
    /// Type of response messages
    type Res: RpcMessage + StatusResponse;
}

/// A connector to a specific service
///
/// This is just a trait alias for a [`transport::Connector`] with the right types. It is used
/// to make it easier to specify the bounds of a connector that matches a specific
/// service.
pub trait Connector<S: Service>: transport::Connector<In = S::Res, Out = S::Req> {}

impl<T: transport::Connector<In = S::Res, Out = S::Req>, S: Service> Connector<S> for T {}

/// A listener for a specific service
///
/// This is just a trait alias for a [`transport::Listener`] with the right types. It is used
/// to make it easier to specify the bounds of a listener that matches a specific
/// service.
pub trait Listener<S: Service>: transport::Listener<In = S::Req, Out = S::Res> {}

impl<T: transport::Listener<In = S::Req, Out = S::Res>, S: Service> Listener<S> for T {}
