//! Resilient client channel
//!
//! A [Channel] wraps an [RpcClient] and applies the [ServiceConfig] of the
//! channel to every call: the method config that matches the method of the call
//! decides whether the call is retried or hedged, and how much time it gets.
//!
//! Retry and hedging need to be able to replay a call, so this only covers the
//! part of a call before it is committed:
//!
//! - rpc: the whole call
//! - client streaming: the whole call, the updates are buffered and replayed
//! - server streaming: until the first response or status arrives
//! - bidi streaming: opening the call
//!
//! The timeout of a method covers the whole call. For streaming calls the
//! response stream ends with `DeadlineExceeded` once the timeout has passed,
//! even if the call was committed before.
//!
//! All diagnostics of the channel are emitted under the span given to the
//! [ChannelBuilder].
use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures_lite::{stream, Future, Stream, StreamExt};
use futures_util::SinkExt;
use tokio::time::{Instant, Sleep};
use tracing::{debug, Instrument, Span};

use crate::{
    client::{BoxStreamSync, UpdateSink},
    message::{BidiStreamingMsg, ClientStreamingMsg, RpcMsg, ServerStreamingMsg},
    pattern::{bidi_streaming, client_streaming, rpc, server_streaming},
    resilience::{self, ConfigError, HedgingPolicy, RetryPolicy, ServiceConfig},
    status::{Code, ErrorCode, Status},
    transport::ConnectionErrors,
    Connector, RequestMethod, RpcClient, Service,
};

mod keep_alive;

pub use keep_alive::KeepAliveConfig;

/// Channel wide limits
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Upper bound for the `max_attempts` of every retry and hedging policy
    pub max_attempts_limit: u32,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            max_attempts_limit: 5,
        }
    }
}

/// Builder for a [Channel]
#[derive(Debug, Default)]
pub struct ChannelBuilder {
    span: Option<Span>,
    service_config: ServiceConfig,
    keep_alive: Option<KeepAliveConfig>,
    options: ChannelOptions,
}

impl ChannelBuilder {
    /// A builder for a channel without retry, hedging or keep-alive
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit all diagnostics of the channel under this span
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Set the service config
    pub fn service_config(mut self, config: ServiceConfig) -> Self {
        self.service_config = config;
        self
    }

    /// Set the keep-alive settings
    pub fn keep_alive(mut self, config: KeepAliveConfig) -> Self {
        self.keep_alive = Some(config);
        self
    }

    /// Set the channel options
    pub fn options(mut self, options: ChannelOptions) -> Self {
        self.options = options;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.options.max_attempts_limit < 1 {
            return Err(ConfigError::InvalidMaxAttempts);
        }
        self.service_config.validate()
    }

    /// Build a channel on top of an existing connector.
    ///
    /// The keep-alive settings are not applied to the connector.
    pub fn build_with<S: Service, C: Connector<S>>(
        self,
        connector: C,
    ) -> Result<Channel<S, C>, ConfigError> {
        self.validate()?;
        let span = self.span.unwrap_or_else(Span::none);
        span.in_scope(|| {
            debug!(
                method_configs = self.service_config.method_configs.len(),
                keep_alive = ?self.keep_alive,
                "channel created"
            )
        });
        Ok(Channel {
            client: RpcClient::new(connector),
            inner: Arc::new(Inner {
                service_config: self.service_config,
                keep_alive: self.keep_alive,
                options: self.options,
                span,
            }),
        })
    }

    /// Build a channel that connects to `uri` over http2, applying the keep-alive settings.
    #[cfg(feature = "hyper-transport")]
    #[cfg_attr(greeter_docsrs, doc(cfg(feature = "hyper-transport")))]
    pub fn build_http<S: Service>(
        self,
        uri: hyper::Uri,
    ) -> Result<Channel<S, crate::client::HyperConnector<S>>, ConfigError> {
        use crate::transport::hyper::{ChannelConfig, HyperConnector};

        let mut config = ChannelConfig::default();
        if let Some(keep_alive) = &self.keep_alive {
            config = config.keep_alive(keep_alive.clone());
        }
        self.build_with(HyperConnector::with_config(uri, config))
    }
}

#[derive(Debug)]
struct Inner {
    service_config: ServiceConfig,
    keep_alive: Option<KeepAliveConfig>,
    options: ChannelOptions,
    span: Span,
}

/// What to do with a call to a method
#[derive(Debug)]
enum Policy {
    Once,
    Retry(RetryPolicy),
    Hedge(HedgingPolicy),
}

/// The point in time by which a call has to be complete
#[derive(Debug, Clone, Copy)]
struct Deadline {
    method: &'static str,
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    fn status(&self) -> Status {
        Status::deadline_exceeded(format!(
            "{} did not complete within {:?}",
            self.method, self.timeout
        ))
    }
}

/// A response stream that ends with `DeadlineExceeded` once the deadline has
/// passed. The inner stream is dropped at that point, which cancels the call.
struct WithDeadline<St> {
    inner: Option<St>,
    sleep: Pin<Box<Sleep>>,
    deadline: Deadline,
}

impl<St> WithDeadline<St> {
    fn new(inner: St, deadline: Deadline) -> Self {
        Self {
            inner: Some(inner),
            sleep: Box::pin(tokio::time::sleep_until(deadline.at)),
            deadline,
        }
    }
}

impl<St, T, C> Stream for WithDeadline<St>
where
    St: Stream<Item = Result<T, Error<C>>> + Unpin,
    C: ConnectionErrors,
{
    type Item = Result<T, Error<C>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        if this.sleep.as_mut().poll(cx).is_ready() {
            this.inner = None;
            debug!(method = this.deadline.method, "response stream ran out of time");
            return Poll::Ready(Some(Err(Error::Status(this.deadline.status()))));
        }
        let item = std::task::ready!(Pin::new(inner).poll_next(cx));
        if item.is_none() {
            this.inner = None;
        }
        Poll::Ready(item)
    }
}

/// A client for a service that retries or hedges calls according to a [ServiceConfig]
#[derive(Debug)]
pub struct Channel<S, C> {
    client: RpcClient<S, C>,
    inner: Arc<Inner>,
}

impl<S, C: Clone> Clone for Channel<S, C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<S: Service, C: Connector<S>> Channel<S, C> {
    /// A channel with default settings on top of a connector
    pub fn new(connector: C) -> Self {
        Self {
            client: RpcClient::new(connector),
            inner: Arc::new(Inner {
                service_config: ServiceConfig::default(),
                keep_alive: None,
                options: ChannelOptions::default(),
                span: Span::none(),
            }),
        }
    }

    /// The client used for the individual attempts
    pub fn client(&self) -> &RpcClient<S, C> {
        &self.client
    }

    /// The service config
    pub fn service_config(&self) -> &ServiceConfig {
        &self.inner.service_config
    }

    /// The keep-alive settings
    pub fn keep_alive(&self) -> Option<&KeepAliveConfig> {
        self.inner.keep_alive.as_ref()
    }

    /// The span all diagnostics of this channel are emitted under
    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// The policy for `method`, and the deadline of a call to it starting now
    fn policy(&self, method: &'static str) -> (Policy, Option<Deadline>) {
        let limit = self.inner.options.max_attempts_limit;
        let Some(config) = self.inner.service_config.resolve(method) else {
            return (Policy::Once, None);
        };
        let policy = if let Some(policy) = &config.retry_policy {
            let mut policy = policy.clone();
            policy.max_attempts = policy.max_attempts.min(limit);
            Policy::Retry(policy)
        } else if let Some(policy) = &config.hedging_policy {
            let mut policy = policy.clone();
            policy.max_attempts = policy.max_attempts.min(limit);
            Policy::Hedge(policy)
        } else {
            Policy::Once
        };
        let deadline = config.timeout.map(|timeout| Deadline {
            method,
            at: Instant::now() + timeout,
            timeout,
        });
        (policy, deadline)
    }

    /// Run the attempts of a call according to `policy`, until `deadline`
    async fn run<T, F, Fut>(
        &self,
        method: &'static str,
        policy: Policy,
        deadline: Option<Deadline>,
        mut attempt: F,
    ) -> Result<T, Error<C>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, Error<C>>>,
    {
        let call = async {
            match policy {
                Policy::Once => attempt(1).await,
                Policy::Retry(policy) => resilience::retry(&policy, method, attempt).await,
                Policy::Hedge(policy) => resilience::hedge(&policy, method, attempt).await,
            }
        };
        let res = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline.at, call).await {
                Ok(res) => res,
                Err(_) => Err(Error::Status(deadline.status())),
            },
            None => call.await,
        };
        if let Err(cause) = &res {
            debug!(method, code = %cause.code(), "call failed: {cause}");
        }
        res
    }

    /// Rpc call, single request, single response
    pub async fn rpc<M>(&self, msg: M) -> Result<M::Response, Error<C>>
    where
        M: RpcMsg<S> + Clone,
    {
        let method = method_of::<S, M>(&msg);
        let (policy, deadline) = self.policy(method);
        self.run(method, policy, deadline, |_| {
            let msg = msg.clone();
            async move { Ok(self.client.rpc(msg).await?) }
        })
        .instrument(self.inner.span.clone())
        .await
    }

    /// Client streaming call with a fixed set of updates
    ///
    /// The updates are sent in order after the initial request, then the
    /// update stream is closed.
    pub async fn client_streaming<M>(
        &self,
        msg: M,
        updates: Vec<M::Update>,
    ) -> Result<M::Response, Error<C>>
    where
        M: ClientStreamingMsg<S> + Clone,
        M::Update: Clone,
    {
        let method = method_of::<S, M>(&msg);
        let updates = &updates;
        let (policy, deadline) = self.policy(method);
        self.run(method, policy, deadline, |_| {
            let msg = msg.clone();
            async move {
                let (mut sink, response) = self.client.client_streaming(msg).await?;
                for update in updates {
                    sink.send(update.clone()).await.map_err(Error::Send)?;
                }
                // closing the sink ends the update stream on the server side
                drop(sink);
                Ok(response.await?)
            }
        })
        .instrument(self.inner.span.clone())
        .await
    }

    /// Server streaming call, single request, stream of responses
    ///
    /// Returns once the first response has arrived, or the server has ended
    /// the call without any response.
    pub async fn server_streaming<M>(
        &self,
        msg: M,
    ) -> Result<stream::Boxed<Result<M::Response, Error<C>>>, Error<C>>
    where
        M: ServerStreamingMsg<S> + Clone,
    {
        let method = method_of::<S, M>(&msg);
        let (policy, deadline) = self.policy(method);
        let responses = self.run(method, policy, deadline, |_| {
            let msg = msg.clone();
            async move {
                let mut responses = self.client.server_streaming(msg).await?;
                match responses.next().await {
                    Some(Ok(first)) => {
                        let rest = responses.map(|item| item.map_err(Error::from));
                        Ok(stream::once(Ok(first)).chain(rest).boxed())
                    }
                    Some(Err(cause)) => Err(cause.into()),
                    None => Ok(stream::empty().boxed()),
                }
            }
        })
        .instrument(self.inner.span.clone())
        .await?;
        Ok(match deadline {
            Some(deadline) => WithDeadline::new(responses, deadline).boxed(),
            None => responses,
        })
    }

    /// Bidi streaming call
    ///
    /// Only opening the call is retried or hedged.
    pub async fn bidi<M>(
        &self,
        msg: M,
    ) -> Result<
        (
            UpdateSink<C, M::Update>,
            BoxStreamSync<'static, Result<M::Response, Error<C>>>,
        ),
        Error<C>,
    >
    where
        M: BidiStreamingMsg<S> + Clone,
    {
        let method = method_of::<S, M>(&msg);
        let (policy, deadline) = self.policy(method);
        let (sink, responses) = self.run(method, policy, deadline, |_| {
            let msg = msg.clone();
            async move {
                let (sink, responses) = self.client.bidi(msg).await?;
                let responses: BoxStreamSync<'static, _> =
                    Box::pin(responses.map(|item| item.map_err(Error::from)));
                Ok((sink, responses))
            }
        })
        .instrument(self.inner.span.clone())
        .await?;
        let responses: BoxStreamSync<'static, _> = match deadline {
            Some(deadline) => Box::pin(WithDeadline::new(responses, deadline)),
            None => responses,
        };
        Ok((sink, responses))
    }
}

fn method_of<S: Service, M: Into<S::Req> + Clone>(msg: &M) -> &'static str {
    let req: S::Req = msg.clone().into();
    req.method()
}

/// Error of a call made through a [Channel]
///
/// This is the union of the errors of the individual interaction patterns, so
/// that the policies can treat all of them the same way.
pub enum Error<C: ConnectionErrors> {
    /// Unable to open a substream
    Open(C::OpenError),
    /// Unable to send a message to the server
    Send(C::SendError),
    /// Unable to receive a message from the server
    Recv(C::RecvError),
    /// The server closed the stream before sending a response
    EarlyClose,
    /// Unexpected response from the server
    Downcast,
    /// The call ended with a status
    Status(Status),
}

impl<C: ConnectionErrors> fmt::Debug for Error<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open(arg0) => f.debug_tuple("Open").field(arg0).finish(),
            Self::Send(arg0) => f.debug_tuple("Send").field(arg0).finish(),
            Self::Recv(arg0) => f.debug_tuple("Recv").field(arg0).finish(),
            Self::EarlyClose => write!(f, "EarlyClose"),
            Self::Downcast => write!(f, "Downcast"),
            Self::Status(arg0) => f.debug_tuple("Status").field(arg0).finish(),
        }
    }
}

impl<C: ConnectionErrors> fmt::Display for Error<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => write!(f, "{status}"),
            _ => fmt::Debug::fmt(self, f),
        }
    }
}

impl<C: ConnectionErrors> std::error::Error for Error<C> {}

impl<C: ConnectionErrors> ErrorCode for Error<C> {
    fn code(&self) -> Code {
        match self {
            Self::Open(_) | Self::Send(_) | Self::Recv(_) | Self::EarlyClose => Code::Unavailable,
            Self::Downcast => Code::Internal,
            Self::Status(status) => status.code(),
        }
    }
}

impl<C: ConnectionErrors> From<rpc::Error<C>> for Error<C> {
    fn from(value: rpc::Error<C>) -> Self {
        match value {
            rpc::Error::Open(e) => Self::Open(e),
            rpc::Error::Send(e) => Self::Send(e),
            rpc::Error::EarlyClose => Self::EarlyClose,
            rpc::Error::RecvError(e) => Self::Recv(e),
            rpc::Error::DowncastError => Self::Downcast,
            rpc::Error::Status(status) => Self::Status(status),
        }
    }
}

impl<C: ConnectionErrors> From<client_streaming::Error<C>> for Error<C> {
    fn from(value: client_streaming::Error<C>) -> Self {
        match value {
            client_streaming::Error::Open(e) => Self::Open(e),
            client_streaming::Error::Send(e) => Self::Send(e),
        }
    }
}

impl<C: ConnectionErrors> From<client_streaming::ItemError<C>> for Error<C> {
    fn from(value: client_streaming::ItemError<C>) -> Self {
        match value {
            client_streaming::ItemError::EarlyClose => Self::EarlyClose,
            client_streaming::ItemError::RecvError(e) => Self::Recv(e),
            client_streaming::ItemError::DowncastError => Self::Downcast,
            client_streaming::ItemError::Status(status) => Self::Status(status),
        }
    }
}

impl<C: ConnectionErrors> From<server_streaming::Error<C>> for Error<C> {
    fn from(value: server_streaming::Error<C>) -> Self {
        match value {
            server_streaming::Error::Open(e) => Self::Open(e),
            server_streaming::Error::Send(e) => Self::Send(e),
        }
    }
}

impl<C: ConnectionErrors> From<server_streaming::ItemError<C>> for Error<C> {
    fn from(value: server_streaming::ItemError<C>) -> Self {
        match value {
            server_streaming::ItemError::RecvError(e) => Self::Recv(e),
            server_streaming::ItemError::DowncastError => Self::Downcast,
            server_streaming::ItemError::Status(status) => Self::Status(status),
        }
    }
}

impl<C: ConnectionErrors> From<bidi_streaming::Error<C>> for Error<C> {
    fn from(value: bidi_streaming::Error<C>) -> Self {
        match value {
            bidi_streaming::Error::Open(e) => Self::Open(e),
            bidi_streaming::Error::Send(e) => Self::Send(e),
        }
    }
}

impl<C: ConnectionErrors> From<bidi_streaming::ItemError<C>> for Error<C> {
    fn from(value: bidi_streaming::ItemError<C>) -> Self {
        match value {
            bidi_streaming::ItemError::RecvError(e) => Self::Recv(e),
            bidi_streaming::ItemError::DowncastError => Self::Downcast,
            bidi_streaming::ItemError::Status(status) => Self::Status(status),
        }
    }
}

#[cfg(all(test, feature = "flume-transport"))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::resilience::{MethodConfig, MethodName};

    #[test]
    fn builder_rejects_invalid_config() {
        let config = ServiceConfig::default().method_config(
            MethodConfig::new([MethodName::Default])
                .retry_policy(RetryPolicy::default())
                .hedging_policy(HedgingPolicy::default()),
        );
        let (_server, client) = crate::transport::flume::channel::<
            crate::greeter::GreeterRequest,
            crate::greeter::GreeterResponse,
        >(1);
        let res = ChannelBuilder::new()
            .service_config(config)
            .build_with::<crate::greeter::GreeterService, _>(client.clone());
        assert_eq!(res.err(), Some(ConfigError::ConflictingPolicies));

        let res = ChannelBuilder::new()
            .options(ChannelOptions {
                max_attempts_limit: 0,
            })
            .build_with::<crate::greeter::GreeterService, _>(client);
        assert_eq!(res.err(), Some(ConfigError::InvalidMaxAttempts));
    }

    #[test]
    fn attempts_are_clamped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            ..Default::default()
        };
        let config = ServiceConfig::default().method_config(
            MethodConfig::new([MethodName::Default])
                .retry_policy(policy)
                .timeout(Duration::from_secs(1)),
        );
        let (_server, client) = crate::transport::flume::channel::<
            crate::greeter::GreeterRequest,
            crate::greeter::GreeterResponse,
        >(1);
        let channel = ChannelBuilder::new()
            .service_config(config)
            .build_with::<crate::greeter::GreeterService, _>(client)
            .unwrap();
        let (policy, deadline) = channel.policy("/greet.Greeter/Greet");
        assert!(matches!(policy, Policy::Retry(p) if p.max_attempts == 5));
        assert_eq!(deadline.map(|d| d.timeout), Some(Duration::from_secs(1)));
    }
}
