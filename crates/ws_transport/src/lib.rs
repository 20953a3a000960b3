//! WebSocket implementation of [`sync_core::transport::SyncTransport`].
//!
//! Frames are JSON text messages. The client sends commands matched to
//! replies by id; the server pushes channel publications as `push` frames,
//! dispatched to the bound handler in arrival order by a single reader task.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sync_core::transport::{PublicationHandler, RpcReply, SyncTransport};
use thiserror::Error;
use tokio::{net::TcpStream, sync::oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum WsTransportError {
    #[error("invalid websocket endpoint {endpoint}: {message}")]
    BadEndpoint { endpoint: String, message: String },
    #[error("not connected")]
    NotConnected,
    #[error("connection closed before a reply arrived")]
    Closed,
    #[error("server rejected command: {message}")]
    Rejected { message: String },
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
enum CommandOp {
    Subscribe,
    Publish,
    Rpc,
}

#[derive(Debug, Serialize, Deserialize)]
struct Command {
    id: u64,
    op: CommandOp,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    data: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    args: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct ServerFrame {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    push: Option<Push>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Push {
    channel: String,
    data: i64,
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type ReplyResult = std::result::Result<Option<Value>, WsTransportError>;
type PendingReplies = Mutex<HashMap<u64, oneshot::Sender<ReplyResult>>>;

pub struct WsTransport {
    endpoint: Url,
    next_id: AtomicU64,
    handlers: Arc<RwLock<HashMap<String, PublicationHandler>>>,
    pending: Arc<PendingReplies>,
    /// Channels requested before the connection was up; flushed on connect.
    subscriptions: Mutex<HashSet<String>>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl WsTransport {
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint).map_err(|err| WsTransportError::BadEndpoint {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        })?;
        Ok(Self {
            endpoint,
            next_id: AtomicU64::new(1),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Mutex::new(HashSet::new()),
            writer: tokio::sync::Mutex::new(None),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_command(&self, command: Command) -> Result<Option<Value>> {
        let id = command.id;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        let frame = serde_json::to_string(&command)?;
        let sent = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => writer
                    .send(Message::Text(frame))
                    .await
                    .context("websocket send failed"),
                None => Err(WsTransportError::NotConnected.into()),
            }
        };
        if let Err(err) = sent {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(WsTransportError::Closed.into()),
        }
    }

    async fn send_subscribe(&self, channel: &str) -> Result<()> {
        self.send_command(Command {
            id: self.next_id(),
            op: CommandOp::Subscribe,
            channel: Some(channel.to_string()),
            data: None,
            method: None,
            args: None,
        })
        .await?;
        Ok(())
    }
}

fn dispatch_frame(
    text: &str,
    handlers: &RwLock<HashMap<String, PublicationHandler>>,
    pending: &PendingReplies,
) {
    let frame: ServerFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("transport: discarding unparseable frame: {err}");
            return;
        }
    };

    if let Some(push) = frame.push {
        let handler = handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&push.channel)
            .cloned();
        match handler {
            Some(handler) => handler(push.data),
            None => debug!("transport: no handler bound for channel {}", push.channel),
        }
        return;
    }

    let Some(id) = frame.id else {
        warn!("transport: frame carries neither id nor push");
        return;
    };
    let waiter = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
    let Some(waiter) = waiter else {
        return;
    };
    let result = match frame.error {
        Some(message) => Err(WsTransportError::Rejected { message }),
        None => Ok(frame.data),
    };
    let _ = waiter.send(result);
}

#[async_trait]
impl SyncTransport for WsTransport {
    fn bind_handler(&self, channel: &str, handler: PublicationHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.to_string(), handler);
    }

    async fn subscribe(&self, channel: &str) -> Result<()> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.to_string());
        let connected = self.writer.lock().await.is_some();
        if !connected {
            // Deferred until connect() flushes recorded subscriptions.
            return Ok(());
        }
        self.send_subscribe(channel).await
    }

    async fn connect(&self) -> Result<()> {
        let (stream, _) = connect_async(self.endpoint.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.endpoint))?;
        let (sink, mut reader) = stream.split();
        *self.writer.lock().await = Some(sink);

        let handlers = Arc::clone(&self.handlers);
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => dispatch_frame(&text, &handlers, &pending),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("transport: websocket read failed: {err}");
                        break;
                    }
                }
            }
            // Fail every command still waiting for a reply.
            let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
            for (_, waiter) in pending.drain() {
                let _ = waiter.send(Err(WsTransportError::Closed));
            }
        });

        let channels: Vec<String> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        for channel in channels {
            self.send_subscribe(&channel).await?;
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: i64) -> Result<()> {
        self.send_command(Command {
            id: self.next_id(),
            op: CommandOp::Publish,
            channel: Some(channel.to_string()),
            data: Some(payload),
            method: None,
            args: None,
        })
        .await?;
        Ok(())
    }

    async fn call(&self, method: &str, args: Option<Value>) -> Result<RpcReply> {
        let data = self
            .send_command(Command {
                id: self.next_id(),
                op: CommandOp::Rpc,
                channel: None,
                data: None,
                method: Some(method.to_string()),
                args,
            })
            .await?;
        Ok(RpcReply {
            data: data.unwrap_or(Value::Null),
        })
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
