use std::net::SocketAddr;

use anyhow::Context;
use greeter_rpc::{
    channel::KeepAliveConfig,
    greeter::{Greeter, GreeterRequest, GreeterResponse, GreeterService},
    interceptor::{LatencyInterceptor, TracingSink},
    server::serve,
    transport::hyper::{ChannelConfig, HyperListener},
    RpcServer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let addr: SocketAddr = std::env::var("GREETER_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:5001".to_string())
        .parse()
        .context("invalid GREETER_ADDR")?;
    let config = ChannelConfig::default().keep_alive(KeepAliveConfig::default());
    let listener = HyperListener::<GreeterRequest, GreeterResponse>::serve_with_config(&addr, config)
        .with_context(|| format!("unable to listen on {addr}"))?;
    info!(%addr, "greeter listening");
    let server = RpcServer::<GreeterService, _>::new(listener);
    serve(
        server,
        Greeter::default(),
        LatencyInterceptor::new(TracingSink),
        Greeter::handle_rpc_request,
    )
    .await?;
    Ok(())
}
