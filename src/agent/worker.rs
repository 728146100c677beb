//! Serves `agent.<name>.request` for one named agent

use super::handler::AgentHandler;
use crate::bus_logger::BusLogger;
use crate::dispatch::prompts::ERROR_REPLY;
use crate::error::{BusResult, DispatchError, DispatchResult};
use crate::lifecycle::Component;
use crate::protocol::{
    chat_id_from_value, validate_segment, AgentRequest, ChatMessage, TopicBuilder,
};
use crate::transport::{handler_fn, Consumer, Envelope, Publisher, SubscriptionId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn, Instrument};

pub struct AgentWorker {
    name: String,
    consumer: Arc<Consumer>,
    publisher: Arc<Publisher>,
    handler: Arc<dyn AgentHandler>,
    logger: BusLogger,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl AgentWorker {
    /// `name` must be usable as a single topic segment
    pub fn new(
        name: impl Into<String>,
        consumer: Arc<Consumer>,
        publisher: Arc<Publisher>,
        handler: Arc<dyn AgentHandler>,
        logger: BusLogger,
    ) -> BusResult<Self> {
        let name = name.into();
        validate_segment(&name)?;
        Ok(Self {
            name,
            consumer,
            publisher,
            handler,
            logger,
            subscription: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request_topic(&self) -> String {
        TopicBuilder::agent_request(&self.name)
    }

    /// Subscribe to this agent's request topic. Idempotent.
    pub async fn start(self: &Arc<Self>) -> BusResult<SubscriptionId> {
        let mut subscription = self.subscription.lock().await;
        if let Some(id) = *subscription {
            return Ok(id);
        }

        let worker = Arc::downgrade(self);
        let handler = handler_fn(move |envelope| {
            let worker = worker.upgrade();
            async move {
                if let Some(worker) = worker {
                    worker.handle_request(envelope).await;
                }
            }
        });

        let id = self.consumer.subscribe(&self.request_topic(), handler).await?;
        *subscription = Some(id);
        info!(agent = %self.name, "Agent listening on {}", self.request_topic());
        Ok(id)
    }

    pub async fn stop(&self) {
        if let Some(id) = self.subscription.lock().await.take() {
            if !self.consumer.unsubscribe(id).await {
                warn!(agent = %self.name, "Request subscription {} could not be removed", id);
            }
        }
        self.consumer.close().await;
        self.publisher.disconnect().await;
    }

    /// Answer one request. Failures go to `<name>.log.error` and, when the
    /// chat is known, the user gets an apology instead of silence.
    pub async fn handle_request(&self, envelope: Envelope) {
        let span = tracing::info_span!("agent_request", agent = %self.name);
        async {
            if let Err(e) = self.process(&envelope).await {
                error!(error = %e, "Agent failed to answer request");
                self.logger.error(format!("Error handling request: {e}")).await;

                let chat_id = envelope.payload.get("chat_id").and_then(chat_id_from_value);
                if chat_id.is_some() {
                    self.reply(ChatMessage::new(chat_id, ERROR_REPLY)).await;
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn process(&self, envelope: &Envelope) -> DispatchResult<()> {
        let request: AgentRequest = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| DispatchError::invalid_payload(e.to_string()))?;

        let text = self.handler.handle(&request).await?;
        let topic = TopicBuilder::user_message_processed();
        if !self.reply(ChatMessage::new(request.chat_id, text)).await {
            return Err(DispatchError::PublishFailed(topic));
        }
        self.logger
            .info(format!("Answered request for chat {:?}", request.chat_id))
            .await;
        Ok(())
    }

    async fn reply(&self, message: ChatMessage) -> bool {
        self.publisher
            .publish(&TopicBuilder::user_message_processed(), &message)
            .await
    }
}

#[async_trait]
impl Component for Arc<AgentWorker> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn launch(&self) -> BusResult<()> {
        self.start().await?;
        self.logger.info(format!("{} started", self.name)).await;
        Ok(())
    }

    async fn release(&self) {
        self.stop().await;
    }
}
