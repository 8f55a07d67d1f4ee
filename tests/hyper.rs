#![cfg(feature = "hyper-transport")]
use std::net::SocketAddr;

use futures_lite::StreamExt;
use futures_util::SinkExt;
use greeter_rpc::{
    channel::{ChannelBuilder, KeepAliveConfig},
    greeter::{
        Greet, GreetMany, GreetManyTimes, GreetOnTheFly, GreetRequest, Greeter, GreeterConfig,
        GreeterRequest, GreeterResponse, GreeterService,
    },
    resilience::{MethodConfig, MethodName, RetryPolicy, ServiceConfig},
    server::serve,
    transport::{
        hyper::{ChannelConfig, HyperListener},
        Listener, LocalAddr,
    },
    RpcServer,
};
use testresult::TestResult;

type Server = HyperListener<GreeterRequest, GreeterResponse>;

fn spawn_server(config: ChannelConfig) -> anyhow::Result<(SocketAddr, Server)> {
    let addr: SocketAddr = "127.0.0.1:0".parse()?;
    let listener = HyperListener::<GreeterRequest, GreeterResponse>::serve_with_config(&addr, config)?;
    let addr = match listener.local_addr() {
        [LocalAddr::Socket(addr)] => *addr,
        other => anyhow::bail!("unexpected local addr {other:?}"),
    };
    let server = RpcServer::<GreeterService, _>::new(listener.clone());
    let greeter = Greeter::new(GreeterConfig {
        greeting_count: 3,
        greeting_interval: std::time::Duration::from_millis(1),
    });
    tokio::spawn(serve(server, greeter, (), Greeter::handle_rpc_request));
    Ok((addr, listener))
}

#[tokio::test]
async fn hyper_greeter() -> TestResult {
    tracing_subscriber::fmt::try_init().ok();
    let keep_alive = KeepAliveConfig::default();
    let (addr, _listener) = spawn_server(ChannelConfig::default().keep_alive(keep_alive.clone()))?;
    let uri: hyper::Uri = format!("http://{addr}").parse()?;
    let channel = ChannelBuilder::new()
        .keep_alive(keep_alive.clone())
        .service_config(ServiceConfig::default().method_config(
            MethodConfig::new([MethodName::Default]).retry_policy(RetryPolicy::default()),
        ))
        .build_http::<GreeterService>(uri)?;
    assert_eq!(channel.keep_alive(), Some(&keep_alive));
    assert_eq!(
        channel.client().as_ref().config().keep_alive_config(),
        Some(&keep_alive)
    );

    let res = channel.rpc(Greet(GreetRequest::new("Will"))).await?;
    assert_eq!(res.message, "Hello Will!");

    let names = ["Will", "Levi"].map(GreetRequest::new).to_vec();
    let res = channel.client_streaming(GreetMany, names).await?;
    assert_eq!(res.message, "Hello Will, Levi!");

    let res = channel
        .server_streaming(GreetManyTimes(GreetRequest::new("Will")))
        .await?
        .map(|res| res.map(|res| res.message))
        .try_collect::<_, _, Vec<_>>()
        .await?;
    assert_eq!(res, vec!["Hello Will 0!", "Hello Will 1!", "Hello Will 2!"]);

    let (mut send, mut recv) = channel.bidi(GreetOnTheFly).await?;
    send.send(GreetRequest::new("Ann")).await?;
    assert_eq!(recv.next().await.unwrap()?.message, "Hello Ann!");
    drop(send);
    assert!(recv.next().await.is_none());
    Ok(())
}

/// calls are spread over several connections only if the keep-alive settings allow it
#[tokio::test]
async fn multiple_connections() -> TestResult {
    for (multiple, expected) in [(true, 3), (false, 1)] {
        let (addr, listener) = spawn_server(ChannelConfig::default())?;
        let uri: hyper::Uri = format!("http://{addr}").parse()?;
        let channel = ChannelBuilder::new()
            .keep_alive(KeepAliveConfig::default().multiple_connections(multiple))
            .build_http::<GreeterService>(uri)?;
        assert_eq!(channel.client().as_ref().connections(), if multiple { 4 } else { 1 });
        for name in ["Ann", "Bob", "Cid"] {
            let res = channel.rpc(Greet(GreetRequest::new(name))).await?;
            assert_eq!(res.message, format!("Hello {name}!"));
        }
        assert_eq!(listener.connections_accepted(), expected);
    }
    Ok(())
}

#[test]
fn connections_per_host_is_validated() {
    assert!(ChannelConfig::default().connections_per_host(0).is_err());
    assert!(ChannelConfig::default().connections_per_host(2).is_ok());
}
