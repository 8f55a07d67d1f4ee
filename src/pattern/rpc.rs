//! RPC interaction pattern.

use futures_lite::{Future, StreamExt};
use futures_util::SinkExt;

use crate::{
    message::{CallShape, InteractionPattern, Msg},
    server::{race_call, send_trailer, watch_peer, RpcChannel, RpcServerError},
    status::{Code, ErrorCode, Status},
    transport::{ConnectionErrors, StreamTypes},
    Connector, RpcClient, Service, StatusResponse,
};

use std::{
    error,
    fmt,
    result,
};

/// Rpc interaction pattern
///
/// There is only one request and one response.
#[derive(Debug, Clone, Copy)]
pub struct Rpc;
impl InteractionPattern for Rpc {
    const SHAPE: CallShape = CallShape::Unary;
}

/// Defines the response type for a rpc message.
///
/// Since this is the most common interaction pattern, this also implements [Msg] for you
/// automatically, with the interaction pattern set to [Rpc]. This is to reduce boilerplate
/// when defining rpc messages.
pub trait RpcMsg<S: Service>: Msg<S, Pattern = Rpc> {
    /// The type for the response
    type Response: Into<S::Res> + TryFrom<S::Res> + Send + 'static;
}

/// We can only do this for one trait, so we do it for RpcMsg since it is the most common
impl<T: RpcMsg<S>, S: Service> Msg<S> for T {
    type Pattern = Rpc;
}

/// Client error. All client DSL methods return a `Result` with this error type.
#[derive(Debug)]
pub enum Error<C: ConnectionErrors> {
    /// Unable to open a substream at all
    Open(C::OpenError),
    /// Unable to send the request to the server
    Send(C::SendError),
    /// Server closed the stream before sending a response
    EarlyClose,
    /// Unable to receive the response from the server
    RecvError(C::RecvError),
    /// Unexpected response from the server
    DowncastError,
    /// The server ended the call with a status instead of a response
    Status(Status),
}

impl<C: ConnectionErrors> fmt::Display for Error<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl<C: ConnectionErrors> error::Error for Error<C> {}

impl<C: ConnectionErrors> ErrorCode for Error<C> {
    fn code(&self) -> Code {
        match self {
            Self::Open(_) | Self::Send(_) | Self::EarlyClose | Self::RecvError(_) => {
                Code::Unavailable
            }
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
    /// RPC call to the server, single request, single response
    pub async fn rpc<M>(&self, msg: M) -> result::Result<M::Response, Error<C>>
    where
        M: RpcMsg<S>,
    {
        let msg = msg.into();
        let (mut send, mut recv) = self.source.open().await.map_err(Error::Open)?;
        send.send(msg).await.map_err(Error::<C>::Send)?;
        let res = recv
            .next()
            .await
            .ok_or(Error::<C>::EarlyClose)?
            .map_err(Error::<C>::RecvError)?;
        // keep send alive until we have the answer
        drop(send);
        let res = res.into_result().map_err(Error::Status)?;
        M::Response::try_from(res).map_err(|_| Error::DowncastError)
    }
}

impl<S, C> RpcChannel<S, C>
where
    S: Service,
    C: StreamTypes<In = S::Req, Out = S::Res>,
{
    /// handle the message of type `M` using the given function on the target object
    ///
    /// The call is aborted when its context is cancelled or its deadline passes,
    /// and when the client goes away. If you want to support concurrent requests,
    /// you need to spawn this on a tokio task yourself.
    pub async fn rpc<M, F, Fut, T>(
        self,
        req: M,
        target: T,
        f: F,
    ) -> result::Result<(), RpcServerError<C>>
    where
        M: RpcMsg<S>,
        F: FnOnce(T, M) -> Fut,
        Fut: Future<Output = M::Response>,
        T: Send + 'static,
    {
        self.try_rpc(req, target, |target, req| async move {
            Ok(f(target, req).await)
        })
        .await
    }

    /// A rpc call where the handler can end the call with a [Status] instead of a response.
    ///
    /// The status is sent to the client and ends up in [Error::Status] on the client side.
    pub async fn try_rpc<M, F, Fut, T>(
        self,
        req: M,
        target: T,
        f: F,
    ) -> result::Result<(), RpcServerError<C>>
    where
        M: RpcMsg<S>,
        F: FnOnce(T, M) -> Fut,
        Fut: Future<Output = result::Result<M::Response, Status>>,
        T: Send + 'static,
    {
        let Self {
            mut send,
            mut recv,
            ctx,
            ..
        } = self;
        let res = race_call(&ctx, watch_peer::<C>(&mut recv), async {
            // get the response
            let res = f(target, req).await.map_err(RpcServerError::Aborted)?;
            // send it and return the error if any
            send.send(res.into())
                .await
                .map_err(RpcServerError::SendError)
        })
        .await;
        send_trailer::<S, C>(&mut send, &res).await;
        res
    }
}
