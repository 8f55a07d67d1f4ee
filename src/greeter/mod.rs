//! The greeter service
//!
//! A small service that exercises all four interaction patterns:
//!
//! | method           | pattern          | response                          |
//! |------------------|------------------|-----------------------------------|
//! | `Greet`          | rpc              | `Hello {name}!`                   |
//! | `GreetMany`      | client streaming | `Hello {name}, {name}, ...!`      |
//! | `GreetManyTimes` | server streaming | `Hello {name} {i}!` for each `i`  |
//! | `GreetOnTheFly`  | bidi streaming   | `Hello {name}!` for each request  |
use std::time::Duration;

use async_stream::stream;
use derive_more::{From, TryInto};
use futures_lite::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::{
    message::{BidiStreaming, BidiStreamingMsg, ClientStreaming, ClientStreamingMsg, Msg},
    message::{RpcMsg, ServerStreaming, ServerStreamingMsg},
    server::{RpcChannel, RpcServerError},
    status::Status,
    transport::StreamTypes,
    RequestMethod, Service, StatusResponse,
};

pub mod drivers;

/// Method identifiers of the greeter service
pub mod method {
    /// Rpc
    pub const GREET: &str = "/greet.Greeter/Greet";
    /// Client streaming
    pub const GREET_MANY: &str = "/greet.Greeter/GreetMany";
    /// Server streaming
    pub const GREET_MANY_TIMES: &str = "/greet.Greeter/GreetManyTimes";
    /// Bidi streaming
    pub const GREET_ON_THE_FLY: &str = "/greet.Greeter/GreetOnTheFly";
}

/// A name to greet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetRequest {
    /// The name
    pub name: String,
}

impl GreetRequest {
    /// A request for `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A greeting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetResponse {
    /// The greeting
    pub message: String,
}

/// Greet a single name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Greet(pub GreetRequest);

/// Greet all names sent as updates at once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreetMany;

/// Greet a single name a number of times
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreetManyTimes(pub GreetRequest);

/// Greet every name sent as an update as soon as it arrives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreetOnTheFly;

/// Request enum of the greeter service
#[derive(Debug, Clone, Serialize, Deserialize, From, TryInto)]
pub enum GreeterRequest {
    Greet(Greet),
    GreetMany(GreetMany),
    GreetManyTimes(GreetManyTimes),
    GreetOnTheFly(GreetOnTheFly),
    /// Update for [GreetMany] and [GreetOnTheFly]
    Name(GreetRequest),
}

impl RequestMethod for GreeterRequest {
    fn method(&self) -> &'static str {
        match self {
            Self::Greet(_) => method::GREET,
            Self::GreetMany(_) => method::GREET_MANY,
            Self::GreetManyTimes(_) => method::GREET_MANY_TIMES,
            Self::GreetOnTheFly(_) => method::GREET_ON_THE_FLY,
            // an update never starts a call
            Self::Name(_) => "",
        }
    }
}

/// Response enum of the greeter service
#[derive(Debug, Clone, Serialize, Deserialize, From, TryInto)]
pub enum GreeterResponse {
    Greeting(GreetResponse),
    Status(Status),
}

impl StatusResponse for GreeterResponse {
    fn from_status(status: Status) -> Self {
        Self::Status(status)
    }

    fn into_result(self) -> Result<Self, Status> {
        match self {
            Self::Status(status) => Err(status),
            res => Ok(res),
        }
    }
}

/// The greeter service
#[derive(Debug, Clone)]
pub struct GreeterService;

impl Service for GreeterService {
    type Req = GreeterRequest;
    type Res = GreeterResponse;
}

impl RpcMsg<GreeterService> for Greet {
    type Response = GreetResponse;
}

impl Msg<GreeterService> for GreetMany {
    type Pattern = ClientStreaming;
}

impl ClientStreamingMsg<GreeterService> for GreetMany {
    type Update = GreetRequest;
    type Response = GreetResponse;
}

impl Msg<GreeterService> for GreetManyTimes {
    type Pattern = ServerStreaming;
}

impl ServerStreamingMsg<GreeterService> for GreetManyTimes {
    type Response = GreetResponse;
}

impl Msg<GreeterService> for GreetOnTheFly {
    type Pattern = BidiStreaming;
}

impl BidiStreamingMsg<GreeterService> for GreetOnTheFly {
    type Update = GreetRequest;
    type Response = GreetResponse;
}

/// Settings of the greeter
#[derive(Debug, Clone)]
pub struct GreeterConfig {
    /// Number of greetings for [GreetManyTimes]
    pub greeting_count: usize,
    /// Pause between two greetings of [GreetManyTimes]
    pub greeting_interval: Duration,
}

impl Default for GreeterConfig {
    fn default() -> Self {
        Self {
            greeting_count: 5,
            greeting_interval: Duration::from_secs(1),
        }
    }
}

/// Greeter service implementation
#[derive(Debug, Clone, Default)]
pub struct Greeter {
    config: GreeterConfig,
}

fn hello(name: impl std::fmt::Display) -> GreetResponse {
    GreetResponse {
        message: format!("Hello {name}!"),
    }
}

impl Greeter {
    /// A greeter with custom settings
    pub fn new(config: GreeterConfig) -> Self {
        Self { config }
    }

    /// The settings
    pub fn config(&self) -> &GreeterConfig {
        &self.config
    }

    async fn greet(self, req: Greet) -> GreetResponse {
        hello(req.0.name)
    }

    async fn greet_many(
        self,
        _req: GreetMany,
        updates: impl Stream<Item = GreetRequest>,
    ) -> GreetResponse {
        // all names have to be in before there is an answer
        let names: Vec<String> = updates.map(|req| req.name).collect().await;
        hello(names.join(", "))
    }

    fn greet_many_times(self, req: GreetManyTimes) -> impl Stream<Item = GreetResponse> {
        let GreeterConfig {
            greeting_count,
            greeting_interval,
        } = self.config;
        let name = req.0.name;
        stream! {
            for i in 0..greeting_count {
                if i > 0 {
                    tokio::time::sleep(greeting_interval).await;
                }
                yield hello(format!("{name} {i}"));
            }
        }
    }

    fn greet_on_the_fly(
        self,
        _req: GreetOnTheFly,
        updates: impl Stream<Item = GreetRequest>,
    ) -> impl Stream<Item = GreetResponse> {
        updates.map(|req| hello(req.name))
    }

    /// Dispatch a call to the handler for its method
    pub async fn handle_rpc_request<C>(
        self,
        req: GreeterRequest,
        chan: RpcChannel<GreeterService, C>,
    ) -> Result<(), RpcServerError<C>>
    where
        C: StreamTypes<In = GreeterRequest, Out = GreeterResponse>,
    {
        use GreeterRequest::*;
        match req {
            Greet(msg) => chan.rpc(msg, self, Self::greet).await,
            GreetMany(msg) => chan.client_streaming(msg, self, Self::greet_many).await,
            GreetManyTimes(msg) => {
                chan.server_streaming(msg, self, Self::greet_many_times)
                    .await
            }
            GreetOnTheFly(msg) => chan.bidi_streaming(msg, self, Self::greet_on_the_fly).await,
            Name(_) => Err(RpcServerError::UnexpectedStartMessage),
        }
    }
}
