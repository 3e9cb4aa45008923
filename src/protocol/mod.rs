//! Boundary to the library that owns the actual protocol socket.
//!
//! The session controller only sees [`ClientFactory`], [`ProtocolClient`] and
//! the event channel handed back in a [`Connection`].

use crate::history::MessageResolver;
use crate::model::{AuthState, ClientEvent, Jid, OutboundInteractiveMessage, SendResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(pub [u32; 3]);

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [major, minor, patch] = self.0;
        write!(f, "{major}.{minor}.{patch}")
    }
}

#[derive(Debug, Default)]
struct RetryCounters {
    order: VecDeque<String>,
    counts: HashMap<String, u32>,
}

/// Retransmission attempts per message id. Shared by every client instance
/// of the process so counts survive reconnects; the oldest ids are forgotten
/// once `capacity` is exceeded.
#[derive(Debug, Clone)]
pub struct RetryCounterCache {
    capacity: usize,
    inner: Arc<Mutex<RetryCounters>>,
}

impl RetryCounterCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Arc::new(Mutex::new(RetryCounters::default())),
        }
    }

    pub fn increment(&self, message_id: &str) -> u32 {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let slot = inner.counts.entry(message_id.to_string()).or_insert(0);
        *slot += 1;
        let count = *slot;
        if count == 1 {
            inner.order.push_back(message_id.to_string());
        }
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.counts.remove(&oldest);
            }
        }
        count
    }
}

#[derive(Clone)]
pub struct ClientConfig {
    pub version: ProtocolVersion,
    pub socket_url: Option<String>,
    pub resolver: Arc<dyn MessageResolver>,
    pub retry_cache: RetryCounterCache,
    pub max_msg_retry_count: u32,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("version", &self.version)
            .field("socket_url", &self.socket_url)
            .field("max_msg_retry_count", &self.max_msg_retry_count)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("client is not connected")]
    NotConnected,
    #[error("send rejected: {0}")]
    Rejected(String),
    #[error("no send result after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn send(
        &self,
        jid: &Jid,
        message: &OutboundInteractiveMessage,
    ) -> Result<SendResult, SendError>;

    /// Tears the connection down; returns once the instance is fully closed.
    async fn close(&self);
}

/// A live client plus the single-consumer stream of its events.
pub struct Connection {
    pub client: Arc<dyn ProtocolClient>,
    pub events: mpsc::Receiver<ClientEvent>,
}

#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(&self, auth: AuthState, config: ClientConfig)
        -> Result<Connection, ClientError>;
}
