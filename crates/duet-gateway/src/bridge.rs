//! Routes each inbound message to the worker or to fallback, based on the
//! current worker health. `route` always produces a [`Response`].

use std::sync::Arc;

use tracing::{debug, info, warn};

use duet_types::config::BridgeConfig;
use duet_types::health::WorkerHealth;
use duet_types::message::{Message, Response};

use crate::auth::OutputObserver;
use crate::events::EventBus;
use crate::fallback::{Fallback, FallbackReason};
use crate::health::HealthHandle;
use crate::ipc::{TransportError, WorkerClient};

pub struct Bridge {
    health: HealthHandle,
    worker: Arc<dyn WorkerClient>,
    fallback: Arc<dyn Fallback>,
    bus: EventBus,
    observer: Option<Arc<dyn OutputObserver>>,
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(
        health: HealthHandle,
        worker: Arc<dyn WorkerClient>,
        fallback: Arc<dyn Fallback>,
        bus: EventBus,
        config: BridgeConfig,
    ) -> Self {
        Self {
            health,
            worker,
            fallback,
            bus,
            observer: None,
            config,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn OutputObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub async fn route(&self, message: &Message) -> Response {
        let conv = message.conversation_id.as_str();
        match self.health.current() {
            WorkerHealth::Up => self.forward_or_fallback(message).await,
            WorkerHealth::Starting => {
                self.bus.notify(conv, "⏳ The worker is starting, please wait…");
                match self.wait_while_starting().await {
                    WorkerHealth::Up => self.forward_or_fallback(message).await,
                    WorkerHealth::Starting => {
                        self.fallback(message, FallbackReason::WorkerStartTimeout).await
                    }
                    WorkerHealth::Down => self.fallback(message, FallbackReason::WorkerDown).await,
                }
            }
            WorkerHealth::Down => {
                self.bus.notify(
                    conv,
                    "⚠️ The worker is down; answering directly in fallback mode.",
                );
                self.fallback(message, FallbackReason::WorkerDown).await
            }
        }
    }

    /// Poll until health leaves `Starting` or the startup wait runs out.
    async fn wait_while_starting(&self) -> WorkerHealth {
        let deadline = tokio::time::Instant::now() + self.config.startup_wait();
        loop {
            let state = self.health.current();
            if state != WorkerHealth::Starting || tokio::time::Instant::now() >= deadline {
                return state;
            }
            tokio::time::sleep(self.config.startup_poll()).await;
        }
    }

    async fn forward_or_fallback(&self, message: &Message) -> Response {
        match self.forward_with_retry(message).await {
            Ok(response) => {
                if let Some(observer) = &self.observer {
                    observer.observe(&response.text, None, Some(&message.conversation_id));
                }
                response
            }
            Err(e) => {
                self.bus.notify(
                    &message.conversation_id,
                    "⚠️ The worker is not answering; switching to fallback mode.",
                );
                self.fallback(message, FallbackReason::WorkerFailed(e.to_string()))
                    .await
            }
        }
    }

    async fn forward_with_retry(&self, message: &Message) -> Result<Response, TransportError> {
        match self.forward(message).await {
            Ok(response) => return Ok(response),
            Err(e) => warn!(
                "Worker request for {} failed: {e}; retrying in {}ms",
                message.conversation_id,
                self.config.retry_delay().as_millis()
            ),
        }
        tokio::time::sleep(self.config.retry_delay()).await;
        self.forward(message).await.inspect_err(|e| {
            warn!("Worker retry for {} failed: {e}", message.conversation_id);
        })
    }

    async fn forward(&self, message: &Message) -> Result<Response, TransportError> {
        debug!("Forwarding message for {} to worker", message.conversation_id);
        match tokio::time::timeout(self.config.request_timeout(), self.worker.send_message(message)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn fallback(&self, message: &Message, reason: FallbackReason) -> Response {
        info!("Routing {} to fallback: {reason}", message.conversation_id);
        let response = self.fallback.invoke(message, reason).await;
        if response.is_empty() {
            return Response::text("⚠️ Fallback produced no answer. Please try again.");
        }
        response
    }
}
