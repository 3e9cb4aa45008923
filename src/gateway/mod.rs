//! Protocol client that talks to a sidecar process owning the real socket.
//!
//! Frames are a u32 little-endian length followed by a msgpack (named)
//! envelope. Byte fields travel as integer arrays.

use crate::model::{
    AuthState, ClientEvent, ConnectionEvent, CredsUpdate, DisconnectReason, InboundMessageEvent,
    Jid, MessageContent, MessageKey, OutboundInteractiveMessage, SendResult,
};
use crate::protocol::{
    ClientConfig, ClientError, ClientFactory, Connection, ProtocolClient, ProtocolVersion,
    SendError,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

const GATEWAY_PROTOCOL_VERSION: u8 = 1;
const MAX_FRAME_SIZE: usize = 1024 * 1024;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

#[cfg(not(test))]
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
#[cfg(test)]
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);

// Upper bound on flushing the close frame to a peer that stopped reading.
#[cfg(not(test))]
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
#[cfg(test)]
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(200);

type PendingSends = Arc<Mutex<HashMap<String, oneshot::Sender<Result<SendResult, SendError>>>>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope<T> {
    v: u8,
    id: String,
    ts_unix_ms: u64,
    #[serde(rename = "type")]
    message_type: String,
    payload: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HelloPayload {
    client_version: String,
    protocol_version: u8,
    wa_version: ProtocolVersion,
    #[serde(default)]
    socket_url: Option<String>,
    auth: AuthState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HelloAckPayload {
    protocol_version: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QrPayload {
    code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ConnectionOpenPayload {
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ConnectionClosePayload {
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SendMessagePayload {
    request_id: String,
    jid: Jid,
    message: OutboundInteractiveMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SendResultPayload {
    request_id: String,
    ok: bool,
    #[serde(default)]
    key: Option<MessageKey>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GetMessagePayload {
    request_id: String,
    key: MessageKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GetMessageResultPayload {
    request_id: String,
    message: Option<MessageContent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ClosePayload {}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn make_envelope<T: Serialize>(message_type: &str, payload: T) -> Envelope<T> {
    Envelope {
        v: GATEWAY_PROTOCOL_VERSION,
        id: Uuid::new_v4().to_string(),
        ts_unix_ms: now_unix_ms(),
        message_type: message_type.to_string(),
        payload,
    }
}

fn decode_payload<T: for<'de> Deserialize<'de>>(
    envelope: &Envelope<serde_json::Value>,
) -> io::Result<T> {
    serde_json::from_value(envelope.payload.clone()).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid {} payload: {err}", envelope.message_type),
        )
    })
}

fn encode_frame<T: Serialize>(message: &Envelope<T>) -> io::Result<Vec<u8>> {
    let payload = rmp_serde::to_vec_named(message).map_err(|err| {
        io::Error::new(io::ErrorKind::InvalidData, format!("encode failed: {err}"))
    })?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("encoded frame too large: {}", payload.len()),
        ));
    }
    Ok(payload)
}

async fn write_raw_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32_le(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

async fn write_frame<W, T>(writer: &mut W, message: &Envelope<T>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = encode_frame(message)?;
    write_raw_frame(writer, &payload).await
}

async fn read_frame<R>(reader: &mut R) -> io::Result<Envelope<serde_json::Value>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len}"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    rmp_serde::from_slice(&buf)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, format!("decode failed: {err}")))
}

/// Connects to the sidecar over TCP for every new client instance.
pub struct GatewayFactory {
    addr: String,
    send_timeout: Duration,
}

impl GatewayFactory {
    pub fn new(addr: impl Into<String>, send_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            send_timeout,
        }
    }
}

#[async_trait]
impl ClientFactory for GatewayFactory {
    async fn create(
        &self,
        auth: AuthState,
        config: ClientConfig,
    ) -> Result<Connection, ClientError> {
        tracing::debug!(addr = %self.addr, "connecting to protocol gateway");
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: self.addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        connect_io(reader, writer, auth, config, self.send_timeout).await
    }
}

enum WriterCmd {
    Frame(Vec<u8>),
    Shutdown,
}

/// Runs the handshake on an already-open byte stream and starts the
/// reader/writer tasks.
pub async fn connect_io<R, W>(
    mut reader: R,
    mut writer: W,
    auth: AuthState,
    config: ClientConfig,
    send_timeout: Duration,
) -> Result<Connection, ClientError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let hello = make_envelope(
        "hello",
        HelloPayload {
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: GATEWAY_PROTOCOL_VERSION,
            wa_version: config.version,
            socket_url: config.socket_url.clone(),
            auth,
        },
    );
    write_frame(&mut writer, &hello).await?;

    let ack = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader))
        .await
        .map_err(|_| ClientError::Handshake("timed out waiting for hello_ack".into()))??;
    if ack.message_type != "hello_ack" {
        return Err(ClientError::Handshake(format!(
            "expected hello_ack, got {}",
            ack.message_type
        )));
    }
    let ack_payload: HelloAckPayload = decode_payload(&ack)?;
    if ack.v != GATEWAY_PROTOCOL_VERSION || ack_payload.protocol_version != GATEWAY_PROTOCOL_VERSION
    {
        return Err(ClientError::Handshake(format!(
            "protocol mismatch (gateway {}, client {})",
            ack_payload.protocol_version, GATEWAY_PROTOCOL_VERSION
        )));
    }
    tracing::info!(version = %config.version, "protocol gateway handshake complete");

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<WriterCmd>(OUTBOUND_CHANNEL_CAPACITY);
    let pending: PendingSends = Arc::new(Mutex::new(HashMap::new()));

    let writer_task = tokio::spawn(async move {
        while let Some(cmd) = outbound_rx.recv().await {
            match cmd {
                WriterCmd::Frame(bytes) => {
                    if let Err(err) = write_raw_frame(&mut writer, &bytes).await {
                        tracing::warn!(error = %err, "gateway write failed");
                        break;
                    }
                }
                WriterCmd::Shutdown => break,
            }
        }
        let _ = writer.shutdown().await;
    });

    let reader_task = tokio::spawn(run_reader(
        reader,
        events_tx,
        outbound_tx.clone(),
        pending.clone(),
        config,
    ));

    let client = GatewayClient {
        outbound: outbound_tx,
        pending,
        send_timeout,
        tasks: Mutex::new(Some((reader_task, writer_task))),
    };
    Ok(Connection {
        client: Arc::new(client),
        events: events_rx,
    })
}

async fn run_reader<R>(
    mut reader: R,
    events: mpsc::Sender<ClientEvent>,
    outbound: mpsc::Sender<WriterCmd>,
    pending: PendingSends,
    config: ClientConfig,
) where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        let incoming = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                break DisconnectReason::new(None, "gateway stream closed");
            }
            Err(err) => {
                break DisconnectReason::new(None, format!("gateway read failed: {err}"));
            }
        };
        if incoming.v != GATEWAY_PROTOCOL_VERSION {
            break DisconnectReason::new(
                None,
                format!(
                    "gateway envelope version mismatch (gateway {}, client {})",
                    incoming.v, GATEWAY_PROTOCOL_VERSION
                ),
            );
        }

        let event = match incoming.message_type.as_str() {
            "qr" => decode_payload::<QrPayload>(&incoming)
                .map(|p| Some(ClientEvent::Connection(ConnectionEvent::Qr { code: p.code }))),
            "connection_open" => decode_payload::<ConnectionOpenPayload>(&incoming).map(|p| {
                Some(ClientEvent::Connection(ConnectionEvent::Open { user_id: p.user_id }))
            }),
            "connection_close" => match decode_payload::<ConnectionClosePayload>(&incoming) {
                Ok(p) => break DisconnectReason::new(p.status_code, p.message),
                Err(err) => Err(err),
            },
            "creds_update" => {
                decode_payload::<CredsUpdate>(&incoming).map(|p| Some(ClientEvent::CredsUpdate(p)))
            }
            "messages_upsert" => decode_payload::<InboundMessageEvent>(&incoming)
                .map(|p| Some(ClientEvent::Messages(p))),
            "send_result" => decode_payload::<SendResultPayload>(&incoming).map(|p| {
                complete_send(&pending, p);
                None
            }),
            "get_message" => match decode_payload::<GetMessagePayload>(&incoming) {
                Ok(p) => {
                    let reply = make_envelope(
                        "get_message_result",
                        GetMessageResultPayload {
                            message: answer_get_message(&config, &p.key),
                            request_id: p.request_id,
                        },
                    );
                    match encode_frame(&reply) {
                        Ok(bytes) => {
                            let _ = outbound.send(WriterCmd::Frame(bytes)).await;
                        }
                        Err(err) => tracing::warn!(error = %err, "get_message reply dropped"),
                    }
                    Ok(None)
                }
                Err(err) => Err(err),
            },
            other => {
                tracing::debug!(message_type = other, "ignoring unknown gateway message");
                Ok(None)
            }
        };

        match event {
            Ok(Some(event)) => {
                if events.send(event).await.is_err() {
                    tracing::debug!("event consumer gone, stopping gateway reader");
                    fail_pending(&pending);
                    return;
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, id = %incoming.id, "dropping malformed gateway message");
            }
        }
    };

    fail_pending(&pending);
    tracing::debug!(reason = %reason, "gateway connection closed");
    let _ = events
        .send(ClientEvent::Connection(ConnectionEvent::Closed { reason }))
        .await;
}

fn complete_send(pending: &PendingSends, payload: SendResultPayload) {
    let Some(tx) = pending.lock().unwrap().remove(&payload.request_id) else {
        tracing::debug!(request_id = %payload.request_id, "send_result for unknown request");
        return;
    };
    let result = match (payload.ok, payload.key) {
        (true, Some(key)) => Ok(SendResult { key }),
        (true, None) => Err(SendError::Transport("send_result without message key".into())),
        (false, _) => Err(SendError::Rejected(
            payload.error.unwrap_or_else(|| "unspecified".to_string()),
        )),
    };
    let _ = tx.send(result);
}

fn fail_pending(pending: &PendingSends) {
    for (_, tx) in pending.lock().unwrap().drain() {
        let _ = tx.send(Err(SendError::NotConnected));
    }
}

/// Counts the retransmission and resolves the content, refusing once the
/// message exceeded its retry budget.
fn answer_get_message(config: &ClientConfig, key: &MessageKey) -> Option<MessageContent> {
    let attempts = config.retry_cache.increment(&key.id);
    if attempts > config.max_msg_retry_count {
        tracing::warn!(
            id = %key.id,
            attempts,
            max = config.max_msg_retry_count,
            "message retry budget exhausted"
        );
        return None;
    }
    config.resolver.resolve(key)
}

pub struct GatewayClient {
    outbound: mpsc::Sender<WriterCmd>,
    pending: PendingSends,
    send_timeout: Duration,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

#[async_trait]
impl ProtocolClient for GatewayClient {
    async fn send(
        &self,
        jid: &Jid,
        message: &OutboundInteractiveMessage,
    ) -> Result<SendResult, SendError> {
        let request_id = Uuid::new_v4().to_string();
        tracing::debug!(kind = message.kind(), to = jid.as_str(), %request_id, "sending message");
        let envelope = make_envelope(
            "send_message",
            SendMessagePayload {
                request_id: request_id.clone(),
                jid: jid.clone(),
                message: message.normalized(),
            },
        );
        let bytes = encode_frame(&envelope).map_err(|err| SendError::Transport(err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(request_id.clone(), tx);
        if self.outbound.send(WriterCmd::Frame(bytes)).await.is_err() {
            self.pending.lock().unwrap().remove(&request_id);
            return Err(SendError::NotConnected);
        }

        match tokio::time::timeout(self.send_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SendError::NotConnected),
            Err(_) => {
                self.pending.lock().unwrap().remove(&request_id);
                Err(SendError::Timeout(self.send_timeout))
            }
        }
    }

    async fn close(&self) {
        let tasks = self.tasks.lock().unwrap().take();
        let Some((reader_task, mut writer_task)) = tasks else {
            return;
        };
        let flush = async {
            if let Ok(bytes) = encode_frame(&make_envelope("close", ClosePayload::default())) {
                let _ = self.outbound.send(WriterCmd::Frame(bytes)).await;
            }
            let _ = self.outbound.send(WriterCmd::Shutdown).await;
            let _ = (&mut writer_task).await;
        };
        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await.is_err() {
            tracing::warn!("gateway peer stopped reading, dropping unsent frames");
            writer_task.abort();
            let _ = writer_task.await;
        }
        reader_task.abort();
        let _ = reader_task.await;
        fail_pending(&self.pending);
        tracing::debug!("gateway client closed");
    }
}
