//! Minimal client for the runner's binary protocol.
//!
//! Used by the integration tests and handy for poking a running instrument.
//! Only `STATUS` gets an answer; every other call returns once the request
//! frame is written.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::protocol::{Command, Request, Response, REQUEST_LEN, RESPONSE_LEN};

/// Connected protocol client.
pub struct RunnerClient {
    stream: TcpStream,
}

impl RunnerClient {
    /// Connect to a runner.
    pub async fn connect(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Send a request without waiting for a response.
    pub async fn send(&mut self, request: &Request) -> std::io::Result<()> {
        self.send_raw(&request.encode()).await
    }

    /// Send an arbitrary request frame.
    pub async fn send_raw(&mut self, frame: &[u8; REQUEST_LEN]) -> std::io::Result<()> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await
    }

    /// `STATUS` round trip.
    pub async fn status(&mut self) -> std::io::Result<Response> {
        self.send(&Request::new(Command::Status)).await?;
        let mut frame = [0u8; RESPONSE_LEN];
        self.stream.read_exact(&mut frame).await?;
        Ok(Response::decode(&frame))
    }

    /// `SHOT` for a filter index, cycle and experiment label.
    pub async fn shot(&mut self, filter_index: u8, cycle: u8, experiment_date: &str) -> std::io::Result<()> {
        self.send(&Request::shot(filter_index, cycle, experiment_date))
            .await
    }

    /// `OFF`, `READY`, `RUN` or `ERROR`.
    pub async fn set_state(&mut self, command: Command) -> std::io::Result<()> {
        self.send(&Request::new(command)).await
    }

    /// `EXIT`, then close the connection.
    pub async fn exit(mut self) -> std::io::Result<()> {
        self.send(&Request::new(Command::Exit)).await?;
        self.stream.shutdown().await
    }
}
