//! Console input: the process's own stdin or a network proxy (telnet, RCON)

use async_trait::async_trait;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use skyhost_core::{Error, Result, StdinConfiguration};

const DEFAULT_PROXY_HOST: &str = "127.0.0.1";
const RCON_AUTH: i32 = 3;
const RCON_EXEC_OR_AUTH_RESPONSE: i32 = 2;
const RCON_MAX_PACKET: i32 = 4096 + 10;
const RCON_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Sink for lines typed into a server console
#[async_trait]
pub trait ConsoleInput: Send {
    async fn send_line(&mut self, line: &str) -> Result<()>;
}

/// Where console input goes for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdinTarget {
    Pipe,
    Telnet { address: String, password: String },
    Rcon { address: String, password: String },
}

impl StdinTarget {
    /// Unknown or unsupported proxy types fall back to the local pipe
    pub fn from_config(config: &StdinConfiguration) -> Self {
        let address = || {
            let host = if config.ip.is_empty() { DEFAULT_PROXY_HOST } else { config.ip.as_str() };
            format!("{}:{}", host, config.port)
        };
        match config.kind.to_lowercase().as_str() {
            "" => StdinTarget::Pipe,
            "telnet" if !config.port.is_empty() => StdinTarget::Telnet {
                address: address(),
                password: config.password.clone(),
            },
            "rcon" if !config.port.is_empty() => StdinTarget::Rcon {
                address: address(),
                password: config.password.clone(),
            },
            other => {
                warn!(kind = %other, "unsupported stdin proxy, using the process stdin");
                StdinTarget::Pipe
            }
        }
    }

    pub fn is_proxy(&self) -> bool {
        !matches!(self, StdinTarget::Pipe)
    }

    /// Connect a proxy target. The pipe is owned by the backend, not connected here.
    pub async fn connect(&self) -> Result<Box<dyn ConsoleInput>> {
        match self {
            StdinTarget::Pipe => Ok(Box::new(NullInput)),
            StdinTarget::Telnet { address, password } => {
                Ok(Box::new(TelnetInput::connect(address, password).await?))
            }
            StdinTarget::Rcon { address, password } => {
                Ok(Box::new(RconInput::connect(address, password).await?))
            }
        }
    }
}

/// Writes lines into a child's stdin or an attached container stream
pub struct PipeInput {
    writer: Pin<Box<dyn AsyncWrite + Send>>,
}

impl PipeInput {
    pub fn new<W: AsyncWrite + Send + 'static>(writer: W) -> Self {
        Self {
            writer: Box::pin(writer),
        }
    }

    pub fn from_boxed(writer: Pin<Box<dyn AsyncWrite + Send>>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl ConsoleInput for PipeInput {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Discards input
pub struct NullInput;

#[async_trait]
impl ConsoleInput for NullInput {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        debug!(line = %line, "discarding console input");
        Ok(())
    }
}

pub struct TelnetInput {
    stream: TcpStream,
}

impl TelnetInput {
    pub async fn connect(address: &str, password: &str) -> Result<Self> {
        let mut stream = TcpStream::connect(address).await?;
        if !password.is_empty() {
            stream.write_all(password.as_bytes()).await?;
            stream.write_all(b"\n").await?;
        }
        Ok(Self { stream })
    }
}

#[async_trait]
impl ConsoleInput for TelnetInput {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        Ok(())
    }
}

/// Source RCON client
pub struct RconInput {
    stream: TcpStream,
    next_id: i32,
}

impl RconInput {
    pub async fn connect(address: &str, password: &str) -> Result<Self> {
        let stream = TcpStream::connect(address).await?;
        let mut rcon = Self { stream, next_id: 1 };
        rcon.authenticate(password).await?;
        Ok(rcon)
    }

    async fn authenticate(&mut self, password: &str) -> Result<()> {
        let id = self.allocate_id();
        self.write_packet(id, RCON_AUTH, password).await?;
        // some servers send an empty response value before the auth response
        loop {
            let (reply_id, kind, _) = self.read_packet().await?;
            if kind != RCON_EXEC_OR_AUTH_RESPONSE {
                continue;
            }
            if reply_id == -1 {
                return Err(Error::OperationFailed("rcon authentication failed".into()));
            }
            return Ok(());
        }
    }

    fn allocate_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    async fn write_packet(&mut self, id: i32, kind: i32, body: &str) -> Result<()> {
        self.stream.write_all(&encode_packet(id, kind, body)).await?;
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<(i32, i32, String)> {
        let size = self.stream.read_i32_le().await?;
        if !(10..=RCON_MAX_PACKET).contains(&size) {
            return Err(Error::OperationFailed(format!("invalid rcon packet size {}", size)));
        }
        let mut payload = vec![0u8; size as usize];
        self.stream.read_exact(&mut payload).await?;
        decode_payload(&payload)
    }
}

#[async_trait]
impl ConsoleInput for RconInput {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        let id = self.allocate_id();
        self.write_packet(id, RCON_EXEC_OR_AUTH_RESPONSE, line).await?;
        match tokio::time::timeout(RCON_REPLY_TIMEOUT, self.read_packet()).await {
            Ok(reply) => {
                reply?;
            }
            Err(_) => debug!("no rcon reply"),
        }
        Ok(())
    }
}

fn encode_packet(id: i32, kind: i32, body: &str) -> Vec<u8> {
    let size = (4 + 4 + body.len() + 2) as i32;
    let mut packet = Vec::with_capacity(size as usize + 4);
    packet.extend_from_slice(&size.to_le_bytes());
    packet.extend_from_slice(&id.to_le_bytes());
    packet.extend_from_slice(&kind.to_le_bytes());
    packet.extend_from_slice(body.as_bytes());
    packet.extend_from_slice(&[0, 0]);
    packet
}

fn decode_payload(payload: &[u8]) -> Result<(i32, i32, String)> {
    if payload.len() < 10 {
        return Err(Error::OperationFailed("short rcon packet".into()));
    }
    let id = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let kind = i32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let body = String::from_utf8_lossy(&payload[8..payload.len() - 2]).into_owned();
    Ok((id, kind, body))
}
