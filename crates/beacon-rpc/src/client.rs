use std::sync::Arc;
use std::time::Duration;

use beacon_state::QueueBackend;
use uuid::Uuid;

use crate::envelope::{RequestFrame, ResponseFrame, RpcRequest, RpcResponse};
use crate::error::RpcError;

/// Client side of the queue RPC transport.
///
/// Cheap to clone; each call gets its own correlation id and reply queue, so
/// a single client may be used concurrently.
#[derive(Clone)]
pub struct RpcClient {
    queues: Arc<dyn QueueBackend>,
    queue_name: String,
}

impl RpcClient {
    pub fn new(queues: Arc<dyn QueueBackend>, queue_name: impl Into<String>) -> Self {
        Self {
            queues,
            queue_name: queue_name.into(),
        }
    }

    /// The queue this client sends to.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Sends `request` to `pattern` on the service queue and awaits the
    /// reply. Fails with [`RpcError::Timeout`] once `timeout` elapses.
    pub async fn call(
        &self,
        pattern: &str,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse, RpcError> {
        let id = Uuid::new_v4().to_string();
        let reply_to = format!("beacon:rpc:reply:{id}");

        let frame = RequestFrame {
            id: id.clone(),
            pattern: pattern.to_string(),
            reply_to: reply_to.clone(),
            request,
        };

        let payload =
            serde_json::to_string(&frame).map_err(|e| RpcError::Serialisation(e.to_string()))?;

        self.queues.push(&self.queue_name, &payload).await?;

        let reply = self
            .queues
            .pop(&reply_to, timeout)
            .await?
            .ok_or(RpcError::Timeout)?;

        let frame: ResponseFrame =
            serde_json::from_str(&reply).map_err(|e| RpcError::Serialisation(e.to_string()))?;

        if frame.id != id {
            // Reply queues are per-call, so this indicates a transport fault.
            return Err(RpcError::Transport(format!(
                "correlation id mismatch: expected {id}, got {}",
                frame.id
            )));
        }

        Ok(frame.response)
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("queue_name", &self.queue_name)
            .finish_non_exhaustive()
    }
}
