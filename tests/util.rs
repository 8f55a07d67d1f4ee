#![cfg(feature = "flume-transport")]
#![allow(dead_code)]
use std::sync::{Arc, Mutex};

use greeter_rpc::{
    client::FlumeConnector,
    greeter::{Greeter, GreeterConfig, GreeterService},
    interceptor::{CallRecord, Interceptor, LatencyInterceptor, LatencySink},
    server::{serve, RpcServerError},
    transport::flume::{self, FlumeListener},
    RpcServer,
};
use greeter_rpc::greeter::{GreeterRequest, GreeterResponse};
use tokio::task::JoinHandle;

pub type Listener = FlumeListener<GreeterRequest, GreeterResponse>;
pub type ServerHandle = JoinHandle<Result<(), RpcServerError<Listener>>>;

/// Serve a greeter over flume, returning the connector and the server task
pub fn spawn_greeter<I: Interceptor>(
    config: GreeterConfig,
    interceptor: I,
) -> (FlumeConnector<GreeterService>, ServerHandle) {
    let (server, client) = flume::channel(8);
    let server = RpcServer::<GreeterService, _>::new(server);
    let handle = tokio::spawn(serve(
        server,
        Greeter::new(config),
        interceptor,
        Greeter::handle_rpc_request,
    ));
    (client, handle)
}

/// Greeter settings that do not make tests wait
pub fn fast_config() -> GreeterConfig {
    GreeterConfig {
        greeting_interval: std::time::Duration::from_millis(1),
        ..Default::default()
    }
}

/// A latency interceptor that collects all records
pub fn recording() -> (Arc<Mutex<Vec<CallRecord>>>, LatencyInterceptor<impl LatencySink>) {
    let records = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let records = records.clone();
        move |record: &CallRecord| records.lock().unwrap().push(record.clone())
    };
    (records, LatencyInterceptor::new(sink))
}

/// Wait until `n` records have been collected
pub async fn wait_for_records(records: &Mutex<Vec<CallRecord>>, n: usize) -> Vec<CallRecord> {
    loop {
        {
            let records = records.lock().unwrap();
            if records.len() >= n {
                return records.clone();
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}

/// Dropping all clients makes the server loop terminate with an accept error
pub async fn check_termination(handle: ServerHandle) -> anyhow::Result<()> {
    match handle.await? {
        Err(RpcServerError::Accept(_)) => Ok(()),
        other => anyhow::bail!("server should have terminated with an accept error, got {other:?}"),
    }
}
