use anyhow::Context;
use greeter_rpc::{
    channel::{ChannelBuilder, KeepAliveConfig},
    greeter::{drivers, GreeterService},
    resilience::{MethodConfig, MethodName, RetryPolicy, ServiceConfig},
};
use tokio::io::BufReader;
use tracing::info_span;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();
    let addr = std::env::var("GREETER_ADDR").unwrap_or_else(|_| "127.0.0.1:5001".to_string());
    let uri: hyper::Uri = format!("http://{addr}")
        .parse()
        .context("invalid GREETER_ADDR")?;
    // transient failures of any method are retried
    let service_config = ServiceConfig::default().method_config(
        MethodConfig::new([MethodName::Default]).retry_policy(RetryPolicy::default()),
    );
    let channel = ChannelBuilder::new()
        .span(info_span!("greeter", %addr))
        .keep_alive(KeepAliveConfig::default())
        .service_config(service_config)
        .build_http::<GreeterService>(uri)?;
    let mut input = BufReader::new(tokio::io::stdin());
    let mut output = tokio::io::stdout();
    drivers::run_all(&channel, &mut input, &mut output).await
}
