//! Retry and hedging of calls
//!
//! The configuration follows the shape of a grpc service config: a list of
//! [MethodConfig]s, each naming the methods it applies to and carrying at most
//! one of a [RetryPolicy] or a [HedgingPolicy].
//!
//! [retry] and [hedge] run attempts produced by a closure. They only look at the
//! [Code](crate::Code) of failed attempts, so they work for any error that
//! implements [ErrorCode](crate::status::ErrorCode).
mod hedging;
mod policy;
mod retry;

pub use hedging::hedge;
pub use policy::{
    ConfigError, HedgingPolicy, MethodConfig, MethodName, RetryPolicy, ServiceConfig,
};
pub use retry::{retry, Backoff};
