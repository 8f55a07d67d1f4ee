//! Client side api
//!
//! The main entry point is [RpcClient].
use std::{
    marker::PhantomData,
    pin::Pin,
    task::{ready, Context, Poll},
};

use futures_lite::Stream;
use futures_sink::Sink;
use pin_project::pin_project;

use crate::{
    status::{Code, Status},
    transport::StreamTypes,
    Connector, Service, StatusResponse,
};

#[cfg(feature = "flume-transport")]
#[cfg_attr(greeter_docsrs, doc(cfg(feature = "flume-transport")))]
/// A flume connector for the given [`Service`]
pub type FlumeConnector<S> =
    crate::transport::flume::FlumeConnector<<S as Service>::Res, <S as Service>::Req>;

#[cfg(feature = "hyper-transport")]
#[cfg_attr(greeter_docsrs, doc(cfg(feature = "hyper-transport")))]
/// A hyper connector for the given [`Service`]
pub type HyperConnector<S> =
    crate::transport::hyper::HyperConnector<<S as Service>::Res, <S as Service>::Req>;

/// Sync version of `future::stream::BoxStream`.
pub type BoxStreamSync<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + Sync + 'a>>;

/// A client for a specific service
///
/// This is a wrapper around a [`Connector`] that serves as the entry point
/// for the client DSL.
///
/// Type parameters:
///
/// `S` is the service type that determines what interactions this client supports.
/// `C` is the connector that determines the transport.
#[derive(Debug)]
pub struct RpcClient<S, C> {
    pub(crate) source: C,
    pub(crate) _p: PhantomData<S>,
}

impl<S, C: Clone> Clone for RpcClient<S, C> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            _p: PhantomData,
        }
    }
}

/// Sink that can be used to send updates to the server for the two interaction patterns
/// that support it, [crate::message::ClientStreaming] and [crate::message::BidiStreaming].
#[pin_project]
#[derive(Debug)]
pub struct UpdateSink<C, T>(#[pin] pub C::SendSink, PhantomData<T>)
where
    C: StreamTypes;

impl<C, T> UpdateSink<C, T>
where
    C: StreamTypes,
    T: Into<C::Out>,
{
    /// Create a new update sink
    pub fn new(sink: C::SendSink) -> Self {
        Self(sink, PhantomData)
    }
}

impl<C, T> Sink<T> for UpdateSink<C, T>
where
    C: StreamTypes,
    T: Into<C::Out>,
{
    type Error = C::SendError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().0.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        let req = item.into();
        self.project().0.start_send(req)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().0.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().0.poll_close(cx)
    }
}

impl<S, C> RpcClient<S, C>
where
    S: Service,
    C: Connector<S>,
{
    /// Create a new rpc client for a specific [Service] given a compatible
    /// [Connector].
    ///
    /// This is where a generic typed connection is converted into a client for a specific service.
    pub fn new(source: C) -> Self {
        Self {
            source,
            _p: PhantomData,
        }
    }

    /// Get the underlying connection
    pub fn into_inner(self) -> C {
        self.source
    }
}

impl<S, C> AsRef<C> for RpcClient<S, C>
where
    S: Service,
    C: Connector<S>,
{
    fn as_ref(&self) -> &C {
        &self.source
    }
}

/// Wrap a stream with an additional item that is kept alive until the stream is dropped
#[pin_project]
pub(crate) struct DeferDrop<S: Stream, X>(#[pin] pub S, pub X);

impl<S: Stream, X> Stream for DeferDrop<S, X> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().0.poll_next(cx)
    }
}

/// Ends a stream of responses at its status trailer.
///
/// An `Ok` trailer ends the stream, any other status is the last item. A
/// stream that ends without a trailer was cut off, which is reported as
/// `Unavailable`.
#[pin_project]
pub(crate) struct UntilTrailer<St> {
    #[pin]
    inner: St,
    done: bool,
}

impl<St> UntilTrailer<St> {
    pub(crate) fn new(inner: St) -> Self {
        Self { inner, done: false }
    }
}

impl<St, R, E> Stream for UntilTrailer<St>
where
    St: Stream<Item = Result<R, E>>,
    R: StatusResponse,
{
    type Item = Result<Result<R, Status>, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }
        let item = match ready!(this.inner.poll_next(cx)) {
            Some(Ok(res)) => match res.into_result() {
                Ok(res) => return Poll::Ready(Some(Ok(Ok(res)))),
                Err(status) if status.code() == Code::Ok => None,
                Err(status) => Some(Ok(Err(status))),
            },
            Some(Err(cause)) => Some(Err(cause)),
            None => Some(Ok(Err(Status::unavailable(
                "response stream ended without a status",
            )))),
        };
        *this.done = true;
        Poll::Ready(item)
    }
}

#[cfg(test)]
mod tests {
    use futures_lite::{stream, StreamExt};

    use super::*;
    use crate::greeter::{GreetResponse, GreeterResponse};

    fn greeting(message: &str) -> Result<GreeterResponse, ()> {
        Ok(GreeterResponse::Greeting(GreetResponse {
            message: message.to_string(),
        }))
    }

    fn status(status: Status) -> Result<GreeterResponse, ()> {
        Ok(GreeterResponse::Status(status))
    }

    #[tokio::test]
    async fn ok_trailer_ends_the_stream() {
        let items = vec![greeting("a"), status(Status::ok()), greeting("b")];
        let res: Vec<_> = UntilTrailer::new(stream::iter(items)).collect().await;
        assert_eq!(res.len(), 1);
        assert!(matches!(&res[0], Ok(Ok(GreeterResponse::Greeting(g))) if g.message == "a"));
    }

    #[tokio::test]
    async fn error_trailer_is_the_last_item() {
        let items = vec![greeting("a"), status(Status::cancelled("gone")), greeting("b")];
        let res: Vec<_> = UntilTrailer::new(stream::iter(items)).collect().await;
        assert_eq!(res.len(), 2);
        assert!(matches!(&res[1], Ok(Err(status)) if status.code() == Code::Cancelled));
    }

    #[tokio::test]
    async fn missing_trailer_is_unavailable() {
        let items = vec![greeting("a")];
        let res: Vec<_> = UntilTrailer::new(stream::iter(items)).collect().await;
        assert_eq!(res.len(), 2);
        assert!(matches!(&res[1], Ok(Err(status)) if status.code() == Code::Unavailable));
    }
}
