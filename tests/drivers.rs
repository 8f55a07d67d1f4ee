#![cfg(feature = "flume-transport")]
use greeter_rpc::{
    channel::Channel,
    greeter::{
        drivers::{run_all, Demo},
        GreeterService,
    },
};
use testresult::TestResult;

mod util;
use util::*;

async fn run(demo: Demo, input: &str) -> anyhow::Result<String> {
    let (connector, _handle) = spawn_greeter(fast_config(), ());
    let channel = Channel::<GreeterService, _>::new(connector);
    let mut input = input.as_bytes();
    let mut output = Vec::new();
    demo.run(&channel, &mut input, &mut output).await?;
    Ok(String::from_utf8(output)?)
}

#[tokio::test]
async fn unary_demo() -> TestResult {
    assert_eq!(run(Demo::Unary, "").await?, "Hello Will!\n\n");
    Ok(())
}

#[tokio::test]
async fn client_streaming_demo() -> TestResult {
    assert_eq!(
        run(Demo::ClientStreaming, "").await?,
        "Hello Will, Carolyn, Levi, Angela!\n\n"
    );
    Ok(())
}

#[tokio::test]
async fn server_streaming_demo() -> TestResult {
    let output = run(Demo::ServerStreaming, "").await?;
    let lines = output.lines().collect::<Vec<_>>();
    assert_eq!(
        lines,
        vec![
            "Hello Will 0!",
            "Hello Will 1!",
            "Hello Will 2!",
            "Hello Will 3!",
            "Hello Will 4!",
            ""
        ]
    );
    Ok(())
}

#[tokio::test]
async fn bidi_demo_stops_at_empty_line() -> TestResult {
    let output = run(Demo::BidiStreaming, "Ann\nBob\n\nNever\n").await?;
    assert!(output.starts_with("Starting to send messages.\n"));
    assert!(output.contains("Disconnecting...\n"));
    let greetings = output
        .lines()
        .filter(|line| line.starts_with("Hello"))
        .collect::<Vec<_>>();
    assert_eq!(greetings, vec!["Hello Ann!", "Hello Bob!"]);
    Ok(())
}

#[tokio::test]
async fn bidi_demo_stops_at_eof() -> TestResult {
    let output = run(Demo::BidiStreaming, "Ann").await?;
    assert!(output.contains("Hello Ann!\n"));
    assert!(output.contains("Disconnecting...\n"));
    Ok(())
}

#[tokio::test]
async fn all_demos_in_order() -> TestResult {
    let (connector, _handle) = spawn_greeter(fast_config(), ());
    let channel = Channel::<GreeterService, _>::new(connector);
    let mut input = "Levi\n\n".as_bytes();
    let mut output = Vec::new();
    run_all(&channel, &mut input, &mut output).await?;
    let output = String::from_utf8(output)?;
    let unary = output.find("Hello Will!").unwrap();
    let many = output.find("Hello Will, Carolyn").unwrap();
    let times = output.find("Hello Will 0!").unwrap();
    let fly = output.find("Hello Levi!").unwrap();
    assert!(unary < many && many < times && times < fly);
    Ok(())
}
