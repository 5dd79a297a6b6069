use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beacon_state::QueueBackend;
use tokio_util::sync::CancellationToken;

use crate::envelope::{RequestFrame, ResponseFrame, RpcRequest, RpcResponse};
use crate::error::RpcError;

/// Poll granularity for the consume loop; bounds shutdown latency.
const POP_INTERVAL: Duration = Duration::from_millis(500);

/// Dispatch target for inbound RPC envelopes.
///
/// Implementations route on the message pattern (e.g. `"auth.login"`) and
/// must not panic; unknown patterns should map to a 404-shaped response.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, pattern: &str, request: RpcRequest) -> RpcResponse;
}

/// Server side of the queue RPC transport: consumes a service queue and
/// replies on the per-call reply queue named in each frame.
pub struct RpcServer {
    queues: Arc<dyn QueueBackend>,
    queue_name: String,
    handler: Arc<dyn MessageHandler>,
}

impl RpcServer {
    pub fn new(
        queues: Arc<dyn QueueBackend>,
        queue_name: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            queues,
            queue_name: queue_name.into(),
            handler,
        }
    }

    /// Runs the consume loop until `cancel` fires. Malformed frames are
    /// logged and dropped; handler responses are always attempted even if
    /// the reply push later fails.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<(), RpcError> {
        tracing::info!(queue = %self.queue_name, "RPC server listening");

        loop {
            let popped = tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!(queue = %self.queue_name, "RPC server stopped");
                    return Ok(());
                }
                result = self.queues.pop(&self.queue_name, POP_INTERVAL) => result?,
            };

            let Some(raw) = popped else { continue };

            let frame: RequestFrame = match serde_json::from_str(&raw) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(
                        queue = %self.queue_name,
                        error = %e,
                        "Dropping malformed RPC frame"
                    );
                    continue;
                }
            };

            let response = self.handler.handle(&frame.pattern, frame.request).await;

            let reply = ResponseFrame {
                id: frame.id,
                response,
            };
            let payload = match serde_json::to_string(&reply) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialise RPC reply");
                    continue;
                }
            };

            if let Err(e) = self.queues.push(&frame.reply_to, &payload).await {
                tracing::warn!(
                    reply_to = %frame.reply_to,
                    error = %e,
                    "Failed to push RPC reply"
                );
            }
        }
    }

    /// Spawns `serve` on the runtime, returning the task handle.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.serve(cancel).await {
                tracing::error!(queue = %self.queue_name, error = %e, "RPC server failed");
            }
        })
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("queue_name", &self.queue_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RpcClient;
    use beacon_state::MemoryQueue;

    struct EchoHandler;

    #[async_trait]
    impl MessageHandler for EchoHandler {
        async fn handle(&self, pattern: &str, request: RpcRequest) -> RpcResponse {
            match pattern {
                "echo.path" => RpcResponse::ok(serde_json::json!({
                    "pattern": pattern,
                    "path": request.path,
                })),
                _ => RpcResponse::error(404, format!("No handler for {pattern}")),
            }
        }
    }

    fn setup() -> (Arc<MemoryQueue>, RpcClient, CancellationToken) {
        let queues = Arc::new(MemoryQueue::new());
        let client = RpcClient::new(queues.clone(), "beacon:queue:test");
        let cancel = CancellationToken::new();

        let server = RpcServer::new(queues.clone(), "beacon:queue:test", Arc::new(EchoHandler));
        server.spawn(cancel.clone());

        (queues, client, cancel)
    }

    #[tokio::test]
    async fn server_round_trip() {
        let (_queues, client, cancel) = setup();

        let request = RpcRequest {
            method: "GET".into(),
            path: "/widgets/7".into(),
            ..Default::default()
        };

        let response = client
            .call("echo.path", request, Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.data.unwrap()["path"], "/widgets/7");

        cancel.cancel();
    }

    #[tokio::test]
    async fn unknown_pattern_gets_error_response() {
        let (_queues, client, cancel) = setup();

        let response = client
            .call("echo.missing", RpcRequest::default(), Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(response.status, 404);
        assert!(response.is_error());

        cancel.cancel();
    }

    #[tokio::test]
    async fn concurrent_calls_keep_correlation() {
        let (_queues, client, cancel) = setup();

        let mut handles = Vec::new();
        for i in 0..8 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let request = RpcRequest {
                    method: "GET".into(),
                    path: format!("/item/{i}"),
                    ..Default::default()
                };
                let response = client
                    .call("echo.path", request, Duration::from_secs(2))
                    .await
                    .unwrap();
                assert_eq!(response.data.unwrap()["path"], format!("/item/{i}"));
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped() {
        let (queues, client, cancel) = setup();

        queues
            .push("beacon:queue:test", "this is not json")
            .await
            .unwrap();

        // The server must survive the garbage and keep answering.
        let response = client
            .call("echo.path", RpcRequest::default(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.status, 200);

        cancel.cancel();
    }
}
