//! Server streaming interaction pattern.

use futures_lite::{Stream, StreamExt};
use futures_util::{SinkExt, TryFutureExt};

use crate::{
    client::{BoxStreamSync, DeferDrop, UntilTrailer},
    message::{CallShape, InteractionPattern, Msg},
    server::{race_call, send_ok_trailer, send_trailer, watch_peer, RpcChannel, RpcServerError},
    status::{Code, ErrorCode, Status},
    transport::{ConnectionErrors, StreamTypes},
    Connector, RpcClient, Service,
};

use std::{
    error,
    fmt,
    result,
};

/// Server streaming interaction pattern
///
/// After the initial request, the server will send a stream of responses.
#[derive(Debug, Clone, Copy)]
pub struct ServerStreaming;
impl InteractionPattern for ServerStreaming {
    const SHAPE: CallShape = CallShape::ServerStreaming;
}

/// Defines response type for a server streaming message.
pub trait ServerStreamingMsg<S: Service>: Msg<S, Pattern = ServerStreaming> {
    /// The type for the response
    type Response: Into<S::Res> + TryFrom<S::Res> + Send + 'static;
}

/// Client error when opening a server streaming call
#[derive(Debug)]
pub enum Error<C: ConnectionErrors> {
    /// Unable to open a substream at all
    Open(C::OpenError),
    /// Unable to send the request to the server
    Send(C::SendError),
}

impl<C: ConnectionErrors> fmt::Display for Error<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl<C: ConnectionErrors> error::Error for Error<C> {}

impl<C: ConnectionErrors> ErrorCode for Error<C> {
    fn code(&self) -> Code {
        Code::Unavailable
    }
}

/// Client error when receiving an item of a server streaming call
#[derive(Debug)]
pub enum ItemError<C: ConnectionErrors> {
    /// Unable to receive the response from the server
    RecvError(C::RecvError),
    /// Unexpected response from the server
    DowncastError,
    /// The server ended the call with a status
    Status(Status),
}

impl<C: ConnectionErrors> fmt::Display for ItemError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl<C: ConnectionErrors> error::Error for ItemError<C> {}

impl<C: ConnectionErrors> ErrorCode for ItemError<C> {
    fn code(&self) -> Code {
        match self {
            Self::RecvError(_) => Code::Unavailable,
            Self::DowncastError => Code::Internal,
            Self::Status(status) => status.code(),
        }
    }
}

impl<S, C> RpcClient<S, C>
where
    S: Service,
    C: Connector<S>,
{
    /// Server streaming call, single request, stream of responses
    pub async fn server_streaming<M>(
        &self,
        msg: M,
    ) -> result::Result<BoxStreamSync<'static, result::Result<M::Response, ItemError<C>>>, Error<C>>
    where
        M: ServerStreamingMsg<S>,
    {
        let msg = msg.into();
        let (mut send, recv) = self.source.open().await.map_err(Error::Open)?;
        send.send(msg).map_err(Error::Send).await?;
        let recv = UntilTrailer::new(recv).map(move |x| match x {
            Ok(Ok(x)) => M::Response::try_from(x).map_err(|_| ItemError::DowncastError),
            Ok(Err(status)) => Err(ItemError::Status(status)),
            Err(e) => Err(ItemError::RecvError(e)),
        });
        // keep send alive so the request on the server side does not get cancelled
        let recv = Box::pin(DeferDrop(recv, send));
        Ok(recv)
    }
}

impl<S, C> RpcChannel<S, C>
where
    S: Service,
    C: StreamTypes<In = S::Req, Out = S::Res>,
{
    /// handle the message M using the given function on the target object
    ///
    /// If you want to support concurrent requests, you need to spawn this on a tokio task yourself.
    pub async fn server_streaming<M, F, Str, T>(
        self,
        req: M,
        target: T,
        f: F,
    ) -> result::Result<(), RpcServerError<C>>
    where
        M: ServerStreamingMsg<S>,
        F: FnOnce(T, M) -> Str + Send + 'static,
        Str: Stream<Item = M::Response> + Send + 'static,
        T: Send + 'static,
    {
        self.try_server_streaming(req, target, move |target, req| f(target, req).map(Ok))
            .await
    }

    /// A server streaming call where the handler can end the call with a [Status].
    ///
    /// The responses before the first error are sent, the error is sent as the
    /// terminal status of the call.
    pub async fn try_server_streaming<M, F, Str, T>(
        self,
        req: M,
        target: T,
        f: F,
    ) -> result::Result<(), RpcServerError<C>>
    where
        M: ServerStreamingMsg<S>,
        F: FnOnce(T, M) -> Str + Send + 'static,
        Str: Stream<Item = result::Result<M::Response, Status>> + Send + 'static,
        T: Send + 'static,
    {
        let Self {
            mut send,
            mut recv,
            ctx,
            ..
        } = self;
        let res = race_call(&ctx, watch_peer::<C>(&mut recv), async {
            let responses = f(target, req);
            tokio::pin!(responses);
            while let Some(response) = responses.next().await {
                let response = response.map_err(RpcServerError::Aborted)?;
                send.send(response.into())
                    .await
                    .map_err(RpcServerError::SendError)?;
            }
            send_ok_trailer::<S, C>(&mut send).await
        })
        .await;
        send_trailer::<S, C>(&mut send, &res).await;
        res
    }
}
