//! Server side api
//!
//! The main entry point is [RpcServer]
use std::{
    error,
    fmt,
    marker::PhantomData,
    pin::Pin,
    result,
    sync::Arc,
    task::{self, Poll},
    time::Duration,
};

use futures_lite::{Future, Stream, StreamExt};
use futures_util::{FutureExt, SinkExt};
use pin_project::pin_project;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    context::CallContext,
    interceptor::Interceptor,
    status::{Code, ErrorCode, Status},
    transport::{ConnectionErrors, StreamTypes},
    Listener, RequestMethod, Service, StatusResponse,
};

/// Server configuration
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    call_timeout: Option<Duration>,
}

impl ServerConfig {
    /// Every call accepted by the server gets a deadline of `timeout` from the
    /// moment its first message has been read.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

/// A server for a specific service.
///
/// This is a wrapper around a [`Listener`] that serves as the entry point for the server DSL.
///
/// Type parameters:
///
/// `S` is the service type.
/// `C` is the channel type.
#[derive(Debug)]
pub struct RpcServer<S, C> {
    /// The channel on which new requests arrive.
    ///
    /// Each new request is a receiver and channel pair on which messages for this request
    /// are received and responses sent.
    source: C,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
    _p: PhantomData<S>,
}

impl<S, C: Clone> Clone for RpcServer<S, C> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            _p: PhantomData,
        }
    }
}

impl<S: Service, C: Listener<S>> RpcServer<S, C> {
    /// Create a new rpc server for a specific service for a [Service] given a compatible
    /// [Listener].
    ///
    /// This is where a generic typed endpoint is converted into a server for a specific service.
    pub fn new(source: C) -> Self {
        Self::with_config(source, ServerConfig::default())
    }

    /// Create a new rpc server with a custom configuration.
    pub fn with_config(source: C, config: ServerConfig) -> Self {
        Self {
            source,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            _p: PhantomData,
        }
    }

    /// Cancel all calls that are currently in flight, and all calls accepted from now on.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// The token that is the parent of the cancellation token of every call.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Accepts a new channel from a client. The result is an [Accepting] object that
    /// can be used to read the first request.
    pub async fn accept(&self) -> result::Result<Accepting<S, C>, RpcServerError<C>> {
        let (send, recv) = self.source.accept().await.map_err(RpcServerError::Accept)?;
        Ok(Accepting {
            send,
            recv,
            config: self.config.clone(),
            cancel: self.shutdown.child_token(),
            local_addr: self.source.local_addr().first().cloned(),
            _p: PhantomData,
        })
    }

    /// Get the underlying service endpoint
    pub fn into_inner(self) -> C {
        self.source
    }
}

impl<S: Service, C: Listener<S>> AsRef<C> for RpcServer<S, C> {
    fn as_ref(&self) -> &C {
        &self.source
    }
}

/// The result of accepting a new connection.
pub struct Accepting<S: Service, C: Listener<S>> {
    send: C::SendSink,
    recv: C::RecvStream,
    config: Arc<ServerConfig>,
    cancel: CancellationToken,
    local_addr: Option<crate::transport::LocalAddr>,
    _p: PhantomData<S>,
}

impl<S: Service, C: Listener<S>> Accepting<S, C> {
    /// Read the first message from the client.
    ///
    /// The return value is a tuple of `(request, channel)`.  Here `request` is the
    /// first request which is already read from the stream.  The `channel` is a
    /// [RpcChannel] that has `sink` and `stream` fields that can be used to send more
    /// requests and/or receive more responses. It also carries the [CallContext]
    /// of the call.
    pub async fn read_first(self) -> result::Result<(S::Req, RpcChannel<S, C>), RpcServerError<C>> {
        let Accepting {
            send,
            mut recv,
            config,
            cancel,
            local_addr,
            ..
        } = self;
        // get the first message from the client. This will tell us what it wants to do.
        let request: S::Req = recv
            .next()
            .await
            // no msg => early close
            .ok_or(RpcServerError::EarlyClose)?
            // recv error
            .map_err(RpcServerError::RecvError)?;
        let mut ctx = CallContext::new(request.method(), cancel);
        if let Some(timeout) = config.call_timeout {
            ctx = ctx.with_timeout(timeout);
        }
        if let Some(addr) = local_addr {
            ctx = ctx.with_local_addr(addr);
        }
        trace!(method = ctx.method(), "call started");
        Ok((request, RpcChannel::new(send, recv, ctx)))
    }
}

/// A channel for requests and responses for a specific service.
///
/// This just groups the sink and stream into a single type, and attaches the
/// information about the service type and the context of the call.
///
/// Sink and stream are independent, so you can take the channel apart and use
/// them independently.
#[derive(Debug)]
pub struct RpcChannel<S: Service, C: StreamTypes<In = S::Req, Out = S::Res>> {
    /// Sink to send responses to the client.
    pub send: C::SendSink,
    /// Stream to receive requests from the client.
    pub recv: C::RecvStream,
    pub(crate) ctx: CallContext,
    _p: PhantomData<S>,
}

impl<S, C> RpcChannel<S, C>
where
    S: Service,
    C: StreamTypes<In = S::Req, Out = S::Res>,
{
    /// Create a new RPC channel.
    pub fn new(send: C::SendSink, recv: C::RecvStream, ctx: CallContext) -> Self {
        Self {
            send,
            recv,
            ctx,
            _p: PhantomData,
        }
    }

    /// The context of the call
    pub fn context(&self) -> &CallContext {
        &self.ctx
    }
}

/// A stream of updates
///
/// If there is any error with receiving or with decoding the updates, the stream will stall and the error will
/// cause a termination of the RPC call.
#[pin_project]
#[derive(Debug)]
pub struct UpdateStream<C, T>(
    #[pin] C::RecvStream,
    Option<oneshot::Sender<RpcServerError<C>>>,
    PhantomData<T>,
)
where
    C: StreamTypes;

impl<C, T> UpdateStream<C, T>
where
    C: StreamTypes,
    T: TryFrom<C::In>,
{
    pub(crate) fn new(recv: C::RecvStream) -> (Self, UnwrapToPending<RpcServerError<C>>) {
        let (error_send, error_recv) = oneshot::channel();
        let error_recv = UnwrapToPending(error_recv);
        (Self(recv, Some(error_send), PhantomData), error_recv)
    }
}

impl<C, T> Stream for UpdateStream<C, T>
where
    C: StreamTypes,
    T: TryFrom<C::In>,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        match Pin::new(&mut this.0).poll_next(cx) {
            Poll::Ready(Some(msg)) => match msg {
                Ok(msg) => match T::try_from(msg) {
                    Ok(msg) => Poll::Ready(Some(msg)),
                    Err(_cause) => {
                        // we were unable to downcast, so we need to send an error
                        if let Some(tx) = this.1.take() {
                            let _ = tx.send(RpcServerError::UnexpectedUpdateMessage);
                        }
                        Poll::Pending
                    }
                },
                Err(cause) => {
                    // we got a recv error, so return pending and send the error
                    if let Some(tx) = this.1.take() {
                        let _ = tx.send(RpcServerError::RecvError(cause));
                    }
                    Poll::Pending
                }
            },
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Server error. All server DSL methods return a `Result` with this error type.
pub enum RpcServerError<C: ConnectionErrors> {
    /// Unable to open a new channel
    Accept(C::AcceptError),
    /// Recv side for a channel was closed before getting the first message
    EarlyClose,
    /// Got an unexpected first message, e.g. an update message
    UnexpectedStartMessage,
    /// Error receiving a message
    RecvError(C::RecvError),
    /// Error sending a response
    SendError(C::SendError),
    /// Got an unexpected update message, e.g. a request message or a non-matching update message
    UnexpectedUpdateMessage,
    /// The call ended with a status instead of a response, because it was
    /// cancelled, ran out of time, lost its client or the handler failed
    Aborted(Status),
}

impl<C: ConnectionErrors> fmt::Debug for RpcServerError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept(arg0) => f.debug_tuple("Accept").field(arg0).finish(),
            Self::EarlyClose => write!(f, "EarlyClose"),
            Self::RecvError(arg0) => f.debug_tuple("RecvError").field(arg0).finish(),
            Self::SendError(arg0) => f.debug_tuple("SendError").field(arg0).finish(),
            Self::UnexpectedStartMessage => f.debug_tuple("UnexpectedStartMessage").finish(),
            Self::UnexpectedUpdateMessage => f.debug_tuple("UnexpectedUpdateMessage").finish(),
            Self::Aborted(arg0) => f.debug_tuple("Aborted").field(arg0).finish(),
        }
    }
}

impl<C: ConnectionErrors> fmt::Display for RpcServerError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self, f)
    }
}

impl<C: ConnectionErrors> error::Error for RpcServerError<C> {}

impl<C: ConnectionErrors> ErrorCode for RpcServerError<C> {
    fn code(&self) -> Code {
        match self {
            Self::Aborted(status) => status.code(),
            Self::UnexpectedStartMessage | Self::UnexpectedUpdateMessage => Code::InvalidArgument,
            Self::Accept(_) | Self::EarlyClose | Self::RecvError(_) | Self::SendError(_) => {
                Code::Unavailable
            }
        }
    }
}

/// Take an oneshot receiver and just return Pending if the sender was dropped without sending
pub(crate) struct UnwrapToPending<T>(oneshot::Receiver<T>);

impl<T> Future for UnwrapToPending<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        match self.0.poll_unpin(cx) {
            Poll::Ready(Ok(x)) => Poll::Ready(x),
            Poll::Ready(Err(_)) => Poll::Pending,
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Waits for the client to do something it is not supposed to do while the
/// server is producing the response of a call with a single request.
///
/// Any further message is a protocol violation, the end of the stream means the
/// client has given up on the call.
pub(crate) async fn watch_peer<C: StreamTypes>(recv: &mut C::RecvStream) -> RpcServerError<C> {
    match recv.next().await {
        Some(Ok(_)) => RpcServerError::UnexpectedUpdateMessage,
        Some(Err(cause)) => RpcServerError::RecvError(cause),
        None => RpcServerError::Aborted(Status::cancelled("client closed the call")),
    }
}

/// Race the work of a call against the call context and against the peer.
///
/// Whichever completes first decides the outcome of the call. The other
/// futures are dropped.
pub(crate) async fn race_call<C, P, W>(
    ctx: &CallContext,
    peer: P,
    work: W,
) -> result::Result<(), RpcServerError<C>>
where
    C: ConnectionErrors,
    P: Future<Output = RpcServerError<C>>,
    W: Future<Output = result::Result<(), RpcServerError<C>>>,
{
    tokio::select! {
        status = ctx.done() => Err(RpcServerError::Aborted(status)),
        cause = peer => Err(cause),
        res = work => res,
    }
}

/// How long an aborted call waits for room to send its terminal status.
const TRAILER_TIMEOUT: Duration = Duration::from_secs(1);

/// Send the terminal status of an aborted call.
///
/// The status waits behind responses that are still queued. A client that does
/// not read them within [TRAILER_TIMEOUT] loses the status, and sees a stream
/// that ended without one.
pub(crate) async fn send_trailer<S, C>(
    send: &mut C::SendSink,
    res: &result::Result<(), RpcServerError<C>>,
) where
    S: Service,
    C: StreamTypes<In = S::Req, Out = S::Res>,
{
    if let Err(RpcServerError::Aborted(status)) = res {
        let trailer = S::Res::from_status(status.clone());
        match tokio::time::timeout(TRAILER_TIMEOUT, send.send(trailer)).await {
            Ok(Ok(())) => {}
            Ok(Err(cause)) => trace!("unable to send the trailer of an aborted call: {cause}"),
            Err(_) => debug!(%status, "no room for the trailer of an aborted call"),
        }
    }
}

/// Send the `Ok` status that ends a successful response stream.
pub(crate) async fn send_ok_trailer<S, C>(
    send: &mut C::SendSink,
) -> result::Result<(), RpcServerError<C>>
where
    S: Service,
    C: StreamTypes<In = S::Req, Out = S::Res>,
{
    send.send(S::Res::from_status(Status::ok()))
        .await
        .map_err(RpcServerError::SendError)
}

/// Run a server loop, invoking a handler callback for each request.
///
/// Every call is handled on its own task, wrapped in the given interceptor. The
/// loop only terminates when the listener can no longer accept calls.
pub async fn serve<S, C, T, I, F, Fut>(
    server: RpcServer<S, C>,
    target: T,
    interceptor: I,
    handler: F,
) -> result::Result<(), RpcServerError<C>>
where
    S: Service,
    C: Listener<S>,
    T: Clone + Send + 'static,
    I: Interceptor,
    F: Fn(T, S::Req, RpcChannel<S, C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = result::Result<(), RpcServerError<C>>> + Send + 'static,
{
    let interceptor = Arc::new(interceptor);
    let handler = Arc::new(handler);
    loop {
        let accepting = server.accept().await?;
        let target = target.clone();
        let interceptor = interceptor.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let (req, chan) = match accepting.read_first().await {
                Ok(x) => x,
                Err(cause) => {
                    debug!("unable to read first message: {cause}");
                    return;
                }
            };
            let ctx = chan.context().clone();
            // the outcome is reported by the interceptors
            let _ = interceptor.intercept(&ctx, handler(target, req, chan)).await;
        });
    }
}
