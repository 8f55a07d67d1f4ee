//! Bidirectional stream interaction pattern.

use futures_lite::{Stream, StreamExt};
use futures_util::SinkExt;

use crate::{
    client::{BoxStreamSync, UntilTrailer, UpdateSink},
    message::{CallShape, InteractionPattern, Msg},
    server::{race_call, send_ok_trailer, send_trailer, RpcChannel, RpcServerError, UpdateStream},
    status::{Code, ErrorCode, Status},
    transport::{ConnectionErrors, StreamTypes},
    Connector, RpcClient, Service,
};

use std::{
    error,
    fmt,
    result,
};

/// Bidirectional streaming interaction pattern
///
/// After the initial request, the client can send updates and the server can send responses.
#[derive(Debug, Clone, Copy)]
pub struct BidiStreaming;
impl InteractionPattern for BidiStreaming {
    const SHAPE: CallShape = CallShape::BidiStreaming;
}

/// Defines update type and response type for a bidi streaming message.
pub trait BidiStreamingMsg<S: Service>: Msg<S, Pattern = BidiStreaming> {
    /// The type for request updates
    ///
    /// For a request that does not support updates, this can be safely set to any type, including
    /// the message type itself. Any update for such a request will result in an error.
    type Update: Into<S::Req> + TryFrom<S::Req> + Send + 'static;

    /// The type for the response
    type Response: Into<S::Res> + TryFrom<S::Res> + Send + 'static;
}

/// Client error when opening a bidi streaming call
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

/// Client error when receiving an item of a bidi streaming call
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
    /// Bidi call to the server, request opens a stream, response is a stream
    pub async fn bidi<M>(
        &self,
        msg: M,
    ) -> result::Result<
        (
            UpdateSink<C, M::Update>,
            BoxStreamSync<'static, result::Result<M::Response, ItemError<C>>>,
        ),
        Error<C>,
    >
    where
        M: BidiStreamingMsg<S>,
    {
        let msg = msg.into();
        let (mut send, recv) = self.source.open().await.map_err(Error::Open)?;
        send.send(msg).await.map_err(Error::<C>::Send)?;
        let send = UpdateSink::new(send);
        let recv = Box::pin(UntilTrailer::new(recv).map(move |x| match x {
            Ok(Ok(x)) => M::Response::try_from(x).map_err(|_| ItemError::DowncastError),
            Ok(Err(status)) => Err(ItemError::Status(status)),
            Err(e) => Err(ItemError::RecvError(e)),
        }));
        Ok((send, recv))
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
    pub async fn bidi_streaming<M, F, Str, T>(
        self,
        req: M,
        target: T,
        f: F,
    ) -> result::Result<(), RpcServerError<C>>
    where
        M: BidiStreamingMsg<S>,
        F: FnOnce(T, M, UpdateStream<C, M::Update>) -> Str + Send + 'static,
        Str: Stream<Item = M::Response> + Send + 'static,
        T: Send + 'static,
    {
        let Self {
            mut send,
            recv,
            ctx,
            ..
        } = self;
        // downcast the updates
        let (updates, read_error) = UpdateStream::new(recv);
        // get the response
        let responses = f(target, req, updates);
        let res = race_call(&ctx, read_error, async {
            tokio::pin!(responses);
            while let Some(response) = responses.next().await {
                // send it and return the error if any
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
