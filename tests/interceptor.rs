#![cfg(feature = "flume-transport")]
use std::time::Duration;

use futures_lite::StreamExt;
use futures_util::SinkExt;
use greeter_rpc::{
    greeter::{
        method, Greet, GreetMany, GreetManyTimes, GreetOnTheFly, GreetRequest, GreeterConfig,
        GreeterService,
    },
    interceptor::{CallOutcome, InterceptorExt},
    RpcClient,
};
use testresult::TestResult;

mod util;
use util::*;

/// every call is recorded exactly once, with its method, no matter the shape
#[tokio::test]
async fn one_record_per_call() -> TestResult {
    tracing_subscriber::fmt::try_init().ok();
    let (all, interceptor) = recording();
    let (connector, _handle) = spawn_greeter(fast_config(), interceptor);
    let client = RpcClient::<GreeterService, _>::new(connector);

    client.rpc(Greet(GreetRequest::new("Will"))).await?;
    let (mut send, recv) = client.client_streaming(GreetMany).await?;
    send.send(GreetRequest::new("Will")).await?;
    drop(send);
    recv.await?;
    let n = client
        .server_streaming(GreetManyTimes(GreetRequest::new("Will")))
        .await?
        .count()
        .await;
    assert_eq!(n, 5);
    let (mut send, mut recv) = client.bidi(GreetOnTheFly).await?;
    send.send(GreetRequest::new("Will")).await?;
    recv.next().await.unwrap()?;
    drop(send);
    while recv.next().await.is_some() {}

    let records = wait_for_records(&all, 4).await;
    let mut methods = records.iter().map(|r| r.method).collect::<Vec<_>>();
    methods.sort();
    let mut expected = vec![
        method::GREET,
        method::GREET_MANY,
        method::GREET_MANY_TIMES,
        method::GREET_ON_THE_FLY,
    ];
    expected.sort();
    assert_eq!(methods, expected);
    assert!(records.iter().all(|r| r.outcome == CallOutcome::Ok));
    // give stray records a chance to show up
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(all.lock().unwrap().len(), 4);
    Ok(())
}

/// the measured time of a streaming call covers the whole stream
#[tokio::test(start_paused = true)]
async fn streaming_latency_covers_stream() -> TestResult {
    let (records, interceptor) = recording();
    let config = GreeterConfig {
        greeting_count: 3,
        greeting_interval: Duration::from_secs(1),
    };
    let (connector, _handle) = spawn_greeter(config, interceptor);
    let client = RpcClient::<GreeterService, _>::new(connector);
    let n = client
        .server_streaming(GreetManyTimes(GreetRequest::new("Will")))
        .await?
        .count()
        .await;
    assert_eq!(n, 3);
    let records = wait_for_records(&records, 1).await;
    assert_eq!(records[0].method, method::GREET_MANY_TIMES);
    assert!(records[0].elapsed >= Duration::from_secs(2));
    Ok(())
}

/// a call abandoned by the client is recorded as failed
#[tokio::test]
async fn abandoned_call_is_recorded() -> TestResult {
    let (records, interceptor) = recording();
    let config = GreeterConfig {
        greeting_count: 5,
        greeting_interval: Duration::from_secs(10),
    };
    let (connector, _handle) = spawn_greeter(config, interceptor);
    let client = RpcClient::<GreeterService, _>::new(connector);
    let mut responses = client
        .server_streaming(GreetManyTimes(GreetRequest::new("Will")))
        .await?;
    responses.next().await.unwrap()?;
    drop(responses);
    let records = wait_for_records(&records, 1).await;
    match &records[0].outcome {
        CallOutcome::Err(cause) => assert!(cause.contains("Cancelled"), "{cause}"),
        other => panic!("unexpected outcome {other:?}"),
    }
    Ok(())
}

/// interceptors compose, the inner one finishes first
#[tokio::test]
async fn stacked_interceptors() -> TestResult {
    let (outer, outer_interceptor) = recording();
    let (inner, inner_interceptor) = recording();
    let stack = outer_interceptor.then(inner_interceptor);
    let (connector, _handle) = spawn_greeter(fast_config(), stack);
    let client = RpcClient::<GreeterService, _>::new(connector);
    client.rpc(Greet(GreetRequest::new("Will"))).await?;
    let inner = wait_for_records(&inner, 1).await;
    let outer = wait_for_records(&outer, 1).await;
    assert_eq!(inner[0].method, method::GREET);
    assert_eq!(outer[0].method, method::GREET);
    assert!(outer[0].elapsed >= inner[0].elapsed);
    Ok(())
}
