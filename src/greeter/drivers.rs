//! Client demos for the greeter
//!
//! Each [Demo] exercises one interaction pattern through a [Channel]. Input is
//! read from an [AsyncBufRead] and output written to an [AsyncWrite], so the
//! binary runs them on stdin and stdout while tests use in-memory buffers.
use std::fmt;

use futures_lite::StreamExt;
use futures_util::SinkExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::{Greet, GreetMany, GreetManyTimes, GreetOnTheFly, GreetRequest, GreeterService};
use crate::{channel::Channel, Connector};

/// Names sent by the client streaming demo
pub const NAMES: [&str; 4] = ["Will", "Carolyn", "Levi", "Angela"];

/// One client demo per interaction pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demo {
    /// Greet a single name
    Unary,
    /// Send a fixed list of names, get a single greeting
    ClientStreaming,
    /// Send a single name, print the greetings as they arrive
    ServerStreaming,
    /// Greet every line of input until an empty line
    BidiStreaming,
}

impl fmt::Display for Demo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unary => "unary",
            Self::ClientStreaming => "client streaming",
            Self::ServerStreaming => "server streaming",
            Self::BidiStreaming => "bidi streaming",
        };
        f.write_str(name)
    }
}

impl Demo {
    /// All demos, in the order they are run by the client
    pub const ALL: [Demo; 4] = [
        Demo::Unary,
        Demo::ClientStreaming,
        Demo::ServerStreaming,
        Demo::BidiStreaming,
    ];

    /// Run the demo
    pub async fn run<C, R, W>(
        self,
        channel: &Channel<GreeterService, C>,
        input: &mut R,
        output: &mut W,
    ) -> anyhow::Result<()>
    where
        C: Connector<GreeterService>,
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        debug!(demo = %self, "running demo");
        match self {
            Self::Unary => {
                let res = channel.rpc(Greet(GreetRequest::new("Will"))).await?;
                output.write_all(format!("{}\n\n", res.message).as_bytes()).await?;
            }
            Self::ClientStreaming => {
                let names = NAMES.map(GreetRequest::new).to_vec();
                let res = channel.client_streaming(GreetMany, names).await?;
                output.write_all(format!("{}\n\n", res.message).as_bytes()).await?;
            }
            Self::ServerStreaming => {
                let mut responses = channel
                    .server_streaming(GreetManyTimes(GreetRequest::new("Will")))
                    .await?;
                while let Some(res) = responses.next().await {
                    output.write_all(format!("{}\n", res?.message).as_bytes()).await?;
                    output.flush().await?;
                }
                output.write_all(b"\n").await?;
            }
            Self::BidiStreaming => {
                let (mut names, mut responses) = channel.bidi(GreetOnTheFly).await?;
                output
                    .write_all(b"Starting to send messages.\nType a name to echo then press enter.\n")
                    .await?;
                output.flush().await?;
                let mut lines = input.lines();
                loop {
                    tokio::select! {
                        line = lines.next_line() => match line? {
                            Some(name) if !name.is_empty() => {
                                names
                                    .send(GreetRequest::new(name))
                                    .await
                                    .map_err(Into::<anyhow::Error>::into)?;
                            }
                            _ => break,
                        },
                        Some(res) = responses.next() => {
                            output.write_all(format!("{}\n", res?.message).as_bytes()).await?;
                            output.flush().await?;
                        }
                    }
                }
                output.write_all(b"Disconnecting...\n").await?;
                // end the update stream, then wait for the remaining greetings
                drop(names);
                while let Some(res) = responses.next().await {
                    output.write_all(format!("{}\n", res?.message).as_bytes()).await?;
                }
            }
        }
        output.flush().await?;
        Ok(())
    }
}

/// Run all demos in order
pub async fn run_all<C, R, W>(
    channel: &Channel<GreeterService, C>,
    input: &mut R,
    output: &mut W,
) -> anyhow::Result<()>
where
    C: Connector<GreeterService>,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    for demo in Demo::ALL {
        demo.run(channel, input, output).await?;
    }
    Ok(())
}
