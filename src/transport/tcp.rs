//! Line-framed TCP fan-out hub.
//!
//! Every connection opens with one JSON binding line naming an exchange and a
//! role. The hub answers `{"bound":"<exchange>"}` once the binding is live.
//! Publishers then send one payload per line; the hub copies each line to every
//! subscriber bound to the same exchange at that moment. Payloads are opaque to
//! the hub and must not contain a newline.

use super::{Publisher, Subscriber, TransportError};
use crate::config::BrokerConfig;
use async_trait::async_trait;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

pub const MAX_FRAME_SIZE: usize = 4096;
const HUB_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Publish,
    Subscribe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub exchange: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Bound {
    bound: String,
}

/// Fan-out hub: one broadcast channel per exchange name, declared on first use.
#[derive(Debug)]
pub struct Hub {
    exchanges: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    capacity: usize,
}

impl Hub {
    pub fn new() -> Self {
        Self::with_capacity(HUB_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            exchanges: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    async fn declare(&self, name: &str) -> broadcast::Sender<Vec<u8>> {
        let mut exchanges = self.exchanges.lock().await;
        exchanges
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(exchange = name, "Exchange declared");
                broadcast::channel(self.capacity).0
            })
            .clone()
    }

    pub async fn exchange_names(&self) -> Vec<String> {
        let exchanges = self.exchanges.lock().await;
        let mut names: Vec<String> = exchanges.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn subscriber_count(&self, exchange: &str) -> usize {
        let exchanges = self.exchanges.lock().await;
        exchanges.get(exchange).map_or(0, broadcast::Sender::receiver_count)
    }

    /// Accept connections until the listener fails permanently.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), TransportError> {
        info!(addr = ?listener.local_addr().ok(), "Show hub listening");

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "Client connected");
                    let hub = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = hub.handle_connection(stream).await {
                            warn!(%addr, error = %e, "Client error");
                        }
                        debug!(%addr, "Client disconnected");
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), TransportError> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = LineReader::new(reader);

        let Some(first) = lines.next_line().await? else {
            return Ok(());
        };
        let binding: Binding = serde_json::from_str(&first)
            .map_err(|e| TransportError::InvalidFrame(format!("bad binding: {e}")))?;
        let exchange = self.declare(&binding.exchange).await;

        match binding.role {
            Role::Publish => {
                write_line(&mut writer, &bound_line(&binding.exchange)?).await?;
                info!(exchange = %binding.exchange, "Publisher bound");

                loop {
                    let line = match lines.next_line().await {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(TransportError::InvalidFrame(reason)) => {
                            warn!(exchange = %binding.exchange, %reason, "Dropping oversized frame");
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    if line.is_empty() {
                        continue;
                    }
                    let receivers = exchange.send(line.into_bytes()).unwrap_or(0);
                    debug!(exchange = %binding.exchange, receivers, "Frame fanned out");
                }
            }
            Role::Subscribe => {
                // Subscribe before acknowledging so nothing published after the
                // ack can be missed.
                let mut frames = exchange.subscribe();
                write_line(&mut writer, &bound_line(&binding.exchange)?).await?;
                info!(exchange = %binding.exchange, "Subscriber bound");

                loop {
                    tokio::select! {
                        frame = frames.recv() => match frame {
                            Ok(payload) => write_line(&mut writer, &payload).await?,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(exchange = %binding.exchange, skipped, "Subscriber lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                        line = lines.next_line() => {
                            // Subscribers never send after binding; EOF means they left.
                            if line?.is_none() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

fn bound_line(exchange: &str) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(&Bound {
        bound: exchange.to_string(),
    })
    .map_err(|e| TransportError::InvalidFrame(e.to_string()))
}

async fn write_line(writer: &mut OwnedWriteHalf, payload: &[u8]) -> Result<(), TransportError> {
    writer.write_all(payload).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

fn check_frame(payload: &[u8]) -> Result<(), TransportError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::InvalidFrame(format!(
            "{} bytes exceeds the {} byte frame limit",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }
    if payload.contains(&b'\n') {
        return Err(TransportError::InvalidFrame("payload contains a newline".to_string()));
    }
    Ok(())
}

impl From<LinesCodecError> for TransportError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::MaxLineLengthExceeded => {
                TransportError::InvalidFrame(format!("line exceeds the {MAX_FRAME_SIZE} byte frame limit"))
            }
            LinesCodecError::Io(e) => TransportError::Io(e),
        }
    }
}

/// Reads newline-terminated frames without buffering more than one frame.
#[derive(Debug)]
struct LineReader {
    reader: OwnedReadHalf,
    codec: LinesCodec,
    buffer: BytesMut,
}

impl LineReader {
    fn new(reader: OwnedReadHalf) -> Self {
        Self {
            reader,
            codec: LinesCodec::new_with_max_length(MAX_FRAME_SIZE),
            buffer: BytesMut::with_capacity(MAX_FRAME_SIZE),
        }
    }

    /// `Ok(None)` at end of stream. An over-long line yields one `InvalidFrame`
    /// and the rest of it is skipped up to the next newline.
    async fn next_line(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            if let Some(line) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(line));
            }
            if self.reader.read_buf(&mut self.buffer).await? == 0 {
                return Ok(self.codec.decode_eof(&mut self.buffer)?);
            }
        }
    }
}

/// Repeats `connect` while the hub is unreachable. Every other failure is returned.
async fn retry_unavailable<T, F, Fut>(retry_delay: Duration, mut connect: F) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    loop {
        match connect().await {
            Err(TransportError::Unavailable { endpoint, source }) => {
                warn!(%endpoint, error = %source, "Show hub unavailable, retrying");
                time::sleep(retry_delay).await;
            }
            other => return other,
        }
    }
}

/// Connect, send the binding line and wait for the hub's acknowledgement.
async fn bind(endpoint: &str, binding: &Binding) -> Result<(LineReader, OwnedWriteHalf), TransportError> {
    let stream = TcpStream::connect(endpoint)
        .await
        .map_err(|source| TransportError::Unavailable {
            endpoint: endpoint.to_string(),
            source,
        })?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = LineReader::new(reader);

    let hello = serde_json::to_vec(binding).map_err(|e| TransportError::InvalidFrame(e.to_string()))?;
    write_line(&mut writer, &hello).await?;

    let ack = lines.next_line().await?.ok_or(TransportError::Closed)?;
    let bound: Bound = serde_json::from_str(&ack)
        .map_err(|e| TransportError::InvalidFrame(format!("bad acknowledgement: {e}")))?;
    if bound.bound != binding.exchange {
        return Err(TransportError::InvalidFrame(format!(
            "bound to {} instead of {}",
            bound.bound, binding.exchange
        )));
    }

    Ok((lines, writer))
}

#[derive(Debug)]
pub struct TcpPublisher {
    exchange: String,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpPublisher {
    pub async fn connect(endpoint: &str, exchange: &str) -> Result<Self, TransportError> {
        let binding = Binding {
            exchange: exchange.to_string(),
            role: Role::Publish,
        };
        let (_, writer) = bind(endpoint, &binding).await?;
        info!(endpoint, exchange, "Publisher connected");

        Ok(Self {
            exchange: binding.exchange,
            writer: Mutex::new(writer),
        })
    }

    pub async fn from_config(config: &BrokerConfig) -> Result<Self, TransportError> {
        Self::connect(&config.endpoint(), &config.exchange).await
    }

    pub async fn connect_retrying(config: &BrokerConfig, retry_delay: Duration) -> Result<Self, TransportError> {
        retry_unavailable(retry_delay, || Self::from_config(config)).await
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }
}

#[async_trait]
impl Publisher for TcpPublisher {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        check_frame(&payload)?;
        let mut writer = self.writer.lock().await;
        write_line(&mut writer, &payload).await
    }
}

#[derive(Debug)]
pub struct TcpSubscriber {
    exchange: String,
    lines: LineReader,
    // Dropping the write half would shut the connection down on the hub side.
    _writer: OwnedWriteHalf,
}

impl TcpSubscriber {
    pub async fn connect(endpoint: &str, exchange: &str) -> Result<Self, TransportError> {
        let binding = Binding {
            exchange: exchange.to_string(),
            role: Role::Subscribe,
        };
        let (lines, writer) = bind(endpoint, &binding).await?;
        info!(endpoint, exchange, "Subscriber connected");

        Ok(Self {
            exchange: binding.exchange,
            lines,
            _writer: writer,
        })
    }

    pub async fn from_config(config: &BrokerConfig) -> Result<Self, TransportError> {
        Self::connect(&config.endpoint(), &config.exchange).await
    }

    pub async fn connect_retrying(config: &BrokerConfig, retry_delay: Duration) -> Result<Self, TransportError> {
        retry_unavailable(retry_delay, || Self::from_config(config)).await
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }
}

#[async_trait]
impl Subscriber for TcpSubscriber {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        self.lines.next_line().await.transpose().map(|line| line.map(String::into_bytes))
    }
}
