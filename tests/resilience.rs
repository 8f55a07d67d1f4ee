#![cfg(feature = "flume-transport")]
//! Retry, hedging and timeouts of the channel, against a greeter that fails on purpose
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_lite::StreamExt;
use futures_util::SinkExt;
use greeter_rpc::{
    channel::{ChannelBuilder, ChannelOptions},
    greeter::{
        Greet, GreetManyTimes, GreetOnTheFly, GreetRequest, GreetResponse, Greeter, GreeterConfig,
        GreeterRequest, GreeterResponse, GreeterService,
    },
    interceptor::CallOutcome,
    resilience::{HedgingPolicy, MethodConfig, MethodName, RetryPolicy, ServiceConfig},
    server::{serve, RpcChannel, RpcServerError},
    status::ErrorCode,
    transport::{flume, StreamTypes},
    Code, RpcServer, Status,
};
use testresult::TestResult;

mod util;
use util::*;

/// How the flaky greeter behaves
#[derive(Debug, Default)]
struct Flaky {
    /// number of calls so far
    calls: AtomicU32,
    /// calls with a number below this fail
    failures: u32,
    /// status code of the failures
    code: Option<Code>,
    /// the first call takes this long
    first_delay: Option<Duration>,
    /// failing server streams send one greeting before the failure
    fail_midway: bool,
}

impl Flaky {
    /// Count a call, waiting if it is the first one. Returns the call number.
    async fn call(&self) -> u32 {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            if let Some(delay) = self.first_delay {
                tokio::time::sleep(delay).await;
            }
        }
        n
    }

    /// The status of call `n`, if it fails
    fn failure(&self, n: u32) -> Option<Status> {
        (n < self.failures).then(|| {
            let code = self.code.unwrap_or(Code::Unavailable);
            Status::new(code, format!("call {n} failed"))
        })
    }
}

async fn flaky_greeter<C>(
    flaky: Arc<Flaky>,
    req: GreeterRequest,
    chan: RpcChannel<GreeterService, C>,
) -> Result<(), RpcServerError<C>>
where
    C: StreamTypes<In = GreeterRequest, Out = GreeterResponse>,
{
    match req {
        GreeterRequest::Greet(msg) => {
            chan.try_rpc(msg, flaky, |flaky, Greet(req)| async move {
                let n = flaky.call().await;
                if let Some(status) = flaky.failure(n) {
                    return Err(status);
                }
                Ok(GreetResponse {
                    message: format!("Hello {}!", req.name),
                })
            })
            .await
        }
        GreeterRequest::GreetManyTimes(msg) => {
            chan.try_server_streaming(msg, flaky, |flaky, GreetManyTimes(req)| {
                async_stream::stream! {
                    let n = flaky.call().await;
                    let failure = flaky.failure(n);
                    for i in 0..3 {
                        if let Some(status) = &failure {
                            if i == 1 || !flaky.fail_midway {
                                yield Err(status.clone());
                                return;
                            }
                        }
                        yield Ok(GreetResponse {
                            message: format!("Hello {} {i}!", req.name),
                        });
                    }
                }
            })
            .await
        }
        other => Greeter::default().handle_rpc_request(other, chan).await,
    }
}

fn retry_config() -> ServiceConfig {
    ServiceConfig::default()
        .method_config(MethodConfig::new([MethodName::Default]).retry_policy(RetryPolicy::default()))
}

fn spawn_flaky(flaky: Flaky) -> (Arc<Flaky>, util::Listener, greeter_rpc::client::FlumeConnector<GreeterService>) {
    let flaky = Arc::new(flaky);
    let (server, client) = flume::channel(8);
    (flaky, server, client)
}

#[tokio::test]
async fn retry_until_success() -> TestResult {
    tracing_subscriber::fmt::try_init().ok();
    let (flaky, server, client) = spawn_flaky(Flaky {
        failures: 2,
        ..Default::default()
    });
    let server = RpcServer::<GreeterService, _>::new(server);
    tokio::spawn(serve(server, flaky.clone(), (), flaky_greeter));

    let channel = ChannelBuilder::new()
        .service_config(retry_config())
        .build_with::<GreeterService, _>(client)?;
    let res = channel.rpc(Greet(GreetRequest::new("Will"))).await?;
    assert_eq!(res.message, "Hello Will!");
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn retry_gives_up() -> TestResult {
    let (flaky, server, client) = spawn_flaky(Flaky {
        failures: 100,
        ..Default::default()
    });
    let server = RpcServer::<GreeterService, _>::new(server);
    tokio::spawn(serve(server, flaky.clone(), (), flaky_greeter));

    let channel = ChannelBuilder::new()
        .service_config(retry_config())
        .build_with::<GreeterService, _>(client)?;
    let err = channel
        .rpc(Greet(GreetRequest::new("Will")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn retry_attempts_are_clamped() -> TestResult {
    let (flaky, server, client) = spawn_flaky(Flaky {
        failures: 100,
        ..Default::default()
    });
    let server = RpcServer::<GreeterService, _>::new(server);
    tokio::spawn(serve(server, flaky.clone(), (), flaky_greeter));

    let policy = RetryPolicy {
        max_attempts: 10,
        ..Default::default()
    };
    let channel = ChannelBuilder::new()
        .service_config(
            ServiceConfig::default()
                .method_config(MethodConfig::new([MethodName::Default]).retry_policy(policy)),
        )
        .options(ChannelOptions {
            max_attempts_limit: 4,
        })
        .build_with::<GreeterService, _>(client)?;
    assert!(channel.rpc(Greet(GreetRequest::new("Will"))).await.is_err());
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 4);
    Ok(())
}

#[tokio::test]
async fn no_retry_for_other_codes() -> TestResult {
    let (flaky, server, client) = spawn_flaky(Flaky {
        failures: 1,
        code: Some(Code::InvalidArgument),
        ..Default::default()
    });
    let server = RpcServer::<GreeterService, _>::new(server);
    tokio::spawn(serve(server, flaky.clone(), (), flaky_greeter));

    let channel = ChannelBuilder::new()
        .service_config(retry_config())
        .build_with::<GreeterService, _>(client)?;
    let err = channel
        .rpc(Greet(GreetRequest::new("Will")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    Ok(())
}

/// the slow first copy loses against the hedged second copy and gets cancelled
#[tokio::test]
async fn hedging_fastest_wins() -> TestResult {
    let (flaky, server, client) = spawn_flaky(Flaky {
        first_delay: Some(Duration::from_secs(30)),
        ..Default::default()
    });
    let (records, interceptor) = recording();
    let server = RpcServer::<GreeterService, _>::new(server);
    tokio::spawn(serve(server, flaky.clone(), interceptor, flaky_greeter));

    let policy = HedgingPolicy {
        hedging_delay: Duration::from_millis(20),
        ..Default::default()
    };
    let channel = ChannelBuilder::new()
        .service_config(ServiceConfig::default().method_config(
            MethodConfig::new([MethodName::exact("/greet.Greeter/Greet")]).hedging_policy(policy),
        ))
        .build_with::<GreeterService, _>(client)?;
    let res = tokio::time::timeout(
        Duration::from_secs(5),
        channel.rpc(Greet(GreetRequest::new("Will"))),
    )
    .await??;
    assert_eq!(res.message, "Hello Will!");
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);

    let records = wait_for_records(&records, 2).await;
    let ok = records.iter().filter(|r| r.outcome.is_ok()).count();
    let cancelled = records
        .iter()
        .filter(|r| matches!(&r.outcome, CallOutcome::Err(cause) if cause.contains("Cancelled")))
        .count();
    assert_eq!((ok, cancelled), (1, 1));
    Ok(())
}

/// a method timeout covers all attempts and ends in a deadline status
#[tokio::test]
async fn method_timeout() -> TestResult {
    let (flaky, server, client) = spawn_flaky(Flaky {
        first_delay: Some(Duration::from_secs(30)),
        ..Default::default()
    });
    let server = RpcServer::<GreeterService, _>::new(server);
    tokio::spawn(serve(server, flaky.clone(), (), flaky_greeter));

    let channel = ChannelBuilder::new()
        .service_config(ServiceConfig::default().method_config(
            MethodConfig::new([MethodName::Default]).timeout(Duration::from_millis(50)),
        ))
        .build_with::<GreeterService, _>(client)?;
    let err = channel
        .rpc(Greet(GreetRequest::new("Will")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    Ok(())
}

/// a server stream through a retrying channel delivers every greeting
#[tokio::test]
async fn server_streaming_through_channel() -> TestResult {
    let (connector, _handle) = spawn_greeter(fast_config(), ());
    let channel = ChannelBuilder::new()
        .service_config(retry_config())
        .build_with::<GreeterService, _>(connector)?;
    let res = channel
        .server_streaming(GreetManyTimes(GreetRequest::new("Will")))
        .await?
        .map(|res| res.map(|res| res.message))
        .try_collect::<_, _, Vec<_>>()
        .await?;
    assert_eq!(res.len(), 5);
    assert_eq!(res[4], "Hello Will 4!");
    Ok(())
}

async fn collect_greetings(
    channel: &greeter_rpc::channel::Channel<
        GreeterService,
        greeter_rpc::client::FlumeConnector<GreeterService>,
    >,
) -> anyhow::Result<Vec<Result<String, Code>>> {
    Ok(channel
        .server_streaming(GreetManyTimes(GreetRequest::new("Will")))
        .await?
        .map(|res| res.map(|res| res.message).map_err(|cause| cause.code()))
        .collect()
        .await)
}

/// a server stream that fails before its first greeting is retried
#[tokio::test]
async fn server_streaming_retried_before_first_item() -> TestResult {
    let (flaky, server, client) = spawn_flaky(Flaky {
        failures: 2,
        ..Default::default()
    });
    let server = RpcServer::<GreeterService, _>::new(server);
    tokio::spawn(serve(server, flaky.clone(), (), flaky_greeter));

    let channel = ChannelBuilder::new()
        .service_config(retry_config())
        .build_with::<GreeterService, _>(client)?;
    let res = collect_greetings(&channel).await?;
    assert_eq!(
        res,
        vec![
            Ok("Hello Will 0!".to_string()),
            Ok("Hello Will 1!".to_string()),
            Ok("Hello Will 2!".to_string()),
        ]
    );
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    Ok(())
}

/// once a greeting has arrived the call is committed, a later failure is not retried
#[tokio::test]
async fn server_streaming_committed_after_first_item() -> TestResult {
    let (flaky, server, client) = spawn_flaky(Flaky {
        failures: 1,
        fail_midway: true,
        ..Default::default()
    });
    let server = RpcServer::<GreeterService, _>::new(server);
    tokio::spawn(serve(server, flaky.clone(), (), flaky_greeter));

    let channel = ChannelBuilder::new()
        .service_config(retry_config())
        .build_with::<GreeterService, _>(client)?;
    let res = collect_greetings(&channel).await?;
    assert_eq!(
        res,
        vec![Ok("Hello Will 0!".to_string()), Err(Code::Unavailable)]
    );
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    Ok(())
}

/// the slow first copy of a hedged server stream is cancelled
#[tokio::test]
async fn server_streaming_hedged() -> TestResult {
    let (flaky, server, client) = spawn_flaky(Flaky {
        first_delay: Some(Duration::from_secs(30)),
        ..Default::default()
    });
    let (records, interceptor) = recording();
    let server = RpcServer::<GreeterService, _>::new(server);
    tokio::spawn(serve(server, flaky.clone(), interceptor, flaky_greeter));

    let policy = HedgingPolicy {
        hedging_delay: Duration::from_millis(20),
        ..Default::default()
    };
    let channel = ChannelBuilder::new()
        .service_config(ServiceConfig::default().method_config(
            MethodConfig::new([MethodName::exact("/greet.Greeter/GreetManyTimes")])
                .hedging_policy(policy),
        ))
        .build_with::<GreeterService, _>(client)?;
    let res = tokio::time::timeout(Duration::from_secs(5), collect_greetings(&channel)).await??;
    assert_eq!(res.len(), 3);
    assert!(res.iter().all(|res| res.is_ok()));
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);

    let records = wait_for_records(&records, 2).await;
    let ok = records.iter().filter(|r| r.outcome.is_ok()).count();
    let cancelled = records
        .iter()
        .filter(|r| matches!(&r.outcome, CallOutcome::Err(cause) if cause.contains("Cancelled")))
        .count();
    assert_eq!((ok, cancelled), (1, 1));
    Ok(())
}

/// the method timeout still applies after a server stream has been committed
#[tokio::test]
async fn method_timeout_covers_server_stream() -> TestResult {
    let (records, interceptor) = recording();
    let config = GreeterConfig {
        greeting_count: 5,
        greeting_interval: Duration::from_millis(100),
    };
    let (connector, _handle) = spawn_greeter(config, interceptor);
    let channel = ChannelBuilder::new()
        .service_config(ServiceConfig::default().method_config(
            MethodConfig::new([MethodName::Default]).timeout(Duration::from_millis(250)),
        ))
        .build_with::<GreeterService, _>(connector)?;
    let start = tokio::time::Instant::now();
    let res = collect_greetings(&channel).await?;
    assert!(start.elapsed() < Duration::from_millis(400));
    let (last, greetings) = res.split_last().unwrap();
    assert_eq!(last, &Err(Code::DeadlineExceeded));
    assert!(!greetings.is_empty() && greetings.len() < 5);
    assert!(greetings.iter().all(|res| res.is_ok()));

    // the server sees the call go away
    let records = wait_for_records(&records, 1).await;
    assert!(matches!(&records[0].outcome, CallOutcome::Err(cause) if cause.contains("Cancelled")));
    Ok(())
}

/// the method timeout ends the responses of a bidi call that is still open
#[tokio::test]
async fn method_timeout_covers_bidi() -> TestResult {
    let (connector, _handle) = spawn_greeter(fast_config(), ());
    let channel = ChannelBuilder::new()
        .service_config(ServiceConfig::default().method_config(
            MethodConfig::new([MethodName::Default]).timeout(Duration::from_millis(100)),
        ))
        .build_with::<GreeterService, _>(connector)?;
    let (mut send, mut recv) = channel.bidi(GreetOnTheFly).await?;
    send.send(GreetRequest::new("Ann")).await?;
    assert_eq!(recv.next().await.unwrap()?.message, "Hello Ann!");
    match recv.next().await {
        Some(Err(cause)) => assert_eq!(cause.code(), Code::DeadlineExceeded),
        other => panic!("expected a deadline status, got {other:?}"),
    }
    assert!(recv.next().await.is_none());
    Ok(())
}
