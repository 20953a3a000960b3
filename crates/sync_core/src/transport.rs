use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

/// Name of the channel the server and every controller lockstep on.
pub const SYNC_CHANNEL: &str = "sync";

/// Callback invoked for each publication delivered on a channel, in arrival
/// order. Handlers run on the transport's reader task and must not block.
pub type PublicationHandler = Arc<dyn Fn(i64) + Send + Sync>;

/// Outer envelope of a remote call reply.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcReply {
    pub data: Value,
}

/// Publish/subscribe transport the controller coordinates over.
///
/// Implementations must accept `subscribe` before `connect`, deferring the
/// wire subscription until the connection is up: the controller begins
/// subscribing before it begins connecting so that no publication delivered
/// between the two can be missed.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Registers `handler` for publications on `channel`. Registration is
    /// synchronous: the handler is live the moment this returns. Re-binding a
    /// channel replaces its previous handler.
    fn bind_handler(&self, channel: &str, handler: PublicationHandler);

    async fn subscribe(&self, channel: &str) -> Result<()>;

    async fn connect(&self) -> Result<()>;

    /// Publishes a single integer payload on `channel`.
    async fn publish(&self, channel: &str, payload: i64) -> Result<()>;

    /// Issues a named remote call and returns the reply envelope.
    async fn call(&self, method: &str, args: Option<Value>) -> Result<RpcReply>;
}

/// Placeholder transport for embedders that wire the real one in later.
pub struct MissingSyncTransport;

#[async_trait]
impl SyncTransport for MissingSyncTransport {
    fn bind_handler(&self, _channel: &str, _handler: PublicationHandler) {}

    async fn subscribe(&self, channel: &str) -> Result<()> {
        Err(anyhow!("sync transport unavailable for channel {channel}"))
    }

    async fn connect(&self) -> Result<()> {
        Err(anyhow!("sync transport unavailable"))
    }

    async fn publish(&self, channel: &str, _payload: i64) -> Result<()> {
        Err(anyhow!("sync transport unavailable for channel {channel}"))
    }

    async fn call(&self, method: &str, _args: Option<Value>) -> Result<RpcReply> {
        Err(anyhow!("sync transport unavailable for method {method}"))
    }
}
