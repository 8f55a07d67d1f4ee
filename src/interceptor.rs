//! Call interceptors
//!
//! An [Interceptor] wraps the complete handling of a call on the server side,
//! no matter which interaction pattern the call uses. For streaming calls the
//! wrapped future completes when the stream has been fully handled.
//!
//! Interceptors compose with [InterceptorExt::then]. The most useful one is the
//! [LatencyInterceptor], which measures how long each call takes.
use std::{fmt, future::Future, time::Duration};

use tokio::time::Instant;
use tracing::{info, warn};

use crate::context::CallContext;

/// Middleware around the handling of a call
pub trait Interceptor: Send + Sync + 'static {
    /// Wrap the future that handles a call.
    ///
    /// The returned future must complete with the result of `call`.
    fn intercept<'a, Fut, T, E>(
        &'a self,
        ctx: &'a CallContext,
        call: Fut,
    ) -> impl Future<Output = Result<T, E>> + Send + 'a
    where
        Fut: Future<Output = Result<T, E>> + Send + 'a,
        T: Send + 'a,
        E: fmt::Display + Send + 'a;
}

/// The identity interceptor
impl Interceptor for () {
    fn intercept<'a, Fut, T, E>(
        &'a self,
        _ctx: &'a CallContext,
        call: Fut,
    ) -> impl Future<Output = Result<T, E>> + Send + 'a
    where
        Fut: Future<Output = Result<T, E>> + Send + 'a,
        T: Send + 'a,
        E: fmt::Display + Send + 'a,
    {
        call
    }
}

/// Two interceptors, `outer` wrapping `inner`
#[derive(Debug, Clone, Default)]
pub struct Stack<Inner, Outer> {
    inner: Inner,
    outer: Outer,
}

impl<Inner, Outer> Stack<Inner, Outer> {
    /// Create a new stack
    pub fn new(inner: Inner, outer: Outer) -> Self {
        Self { inner, outer }
    }
}

impl<Inner: Interceptor, Outer: Interceptor> Interceptor for Stack<Inner, Outer> {
    fn intercept<'a, Fut, T, E>(
        &'a self,
        ctx: &'a CallContext,
        call: Fut,
    ) -> impl Future<Output = Result<T, E>> + Send + 'a
    where
        Fut: Future<Output = Result<T, E>> + Send + 'a,
        T: Send + 'a,
        E: fmt::Display + Send + 'a,
    {
        self.outer.intercept(ctx, self.inner.intercept(ctx, call))
    }
}

/// Extension trait to compose interceptors
pub trait InterceptorExt: Interceptor + Sized {
    /// Run `next` inside of this interceptor.
    ///
    /// `a.then(b)` sees a call before `b` does, and sees its outcome after `b` does.
    fn then<I: Interceptor>(self, next: I) -> Stack<I, Self> {
        Stack::new(next, self)
    }
}

impl<I: Interceptor> InterceptorExt for I {}

/// How a call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// The call completed successfully
    Ok,
    /// The call failed with the given error
    Err(String),
    /// The call was dropped before it completed
    Abandoned,
}

impl CallOutcome {
    /// True if the call completed successfully
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Timing information of a single call
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// The method identifier of the call
    pub method: &'static str,
    /// Wall clock time from the start of the call until it completed
    pub elapsed: Duration,
    /// How the call ended
    pub outcome: CallOutcome,
}

/// Destination for call records
pub trait LatencySink: Send + Sync + 'static {
    /// Called exactly once per call
    fn record(&self, record: &CallRecord);
}

impl<F> LatencySink for F
where
    F: Fn(&CallRecord) + Send + Sync + 'static,
{
    fn record(&self, record: &CallRecord) {
        self(record)
    }
}

/// Emits call records as tracing events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LatencySink for TracingSink {
    fn record(&self, record: &CallRecord) {
        let elapsed_ms = u64::try_from(record.elapsed.as_millis()).unwrap_or(u64::MAX);
        match &record.outcome {
            CallOutcome::Ok => info!(method = record.method, elapsed_ms, "call completed"),
            CallOutcome::Err(cause) => {
                warn!(method = record.method, elapsed_ms, %cause, "call failed")
            }
            CallOutcome::Abandoned => warn!(method = record.method, elapsed_ms, "call abandoned"),
        }
    }
}

/// Measures the wall clock duration of every call
///
/// The measurement starts when the call starts being handled and ends when the
/// handler completes, after the last response of a streaming call has been sent.
#[derive(Debug, Clone, Default)]
pub struct LatencyInterceptor<K = TracingSink> {
    sink: K,
}

impl<K: LatencySink> LatencyInterceptor<K> {
    /// Create a latency interceptor that reports to the given sink
    pub fn new(sink: K) -> Self {
        Self { sink }
    }

    /// The sink records are reported to
    pub fn sink(&self) -> &K {
        &self.sink
    }
}

impl<K: LatencySink> Interceptor for LatencyInterceptor<K> {
    fn intercept<'a, Fut, T, E>(
        &'a self,
        ctx: &'a CallContext,
        call: Fut,
    ) -> impl Future<Output = Result<T, E>> + Send + 'a
    where
        Fut: Future<Output = Result<T, E>> + Send + 'a,
        T: Send + 'a,
        E: fmt::Display + Send + 'a,
    {
        async move {
            let mut timer = Timer {
                sink: &self.sink,
                method: ctx.method(),
                start: Instant::now(),
                outcome: None,
            };
            let res = call.await;
            timer.outcome = Some(match &res {
                Ok(_) => CallOutcome::Ok,
                Err(cause) => CallOutcome::Err(cause.to_string()),
            });
            res
        }
    }
}

/// Reports on drop, so a call that is dropped halfway is reported as well.
struct Timer<'a, K: LatencySink> {
    sink: &'a K,
    method: &'static str,
    start: Instant,
    outcome: Option<CallOutcome>,
}

impl<K: LatencySink> Drop for Timer<'_, K> {
    fn drop(&mut self) {
        let record = CallRecord {
            method: self.method,
            elapsed: self.start.elapsed(),
            outcome: self.outcome.take().unwrap_or(CallOutcome::Abandoned),
        };
        self.sink.record(&record);
    }
}
