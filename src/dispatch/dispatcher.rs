//! Routes inbound user messages to agents
//!
//! The dispatcher subscribes once to `user.message.new`. For each message it
//! asks the classifier for a [`RoutingDecision`], then publishes the
//! classifier's object, with `chat_id` added, to `agent.<name>.request`.
//! When the classifier picked no agent and asks for clarification, the
//! question goes straight back to the user instead. Any failure is reported
//! to `dispatcher.log.error` and the message is dropped.

use crate::bus_logger::BusLogger;
use crate::config::DispatcherSection;
use crate::dispatch::classifier::Classifier;
use crate::dispatch::prompts::MAIA_DISPATCHER_PROMPT;
use crate::error::{BusResult, DispatchError, DispatchResult};
use crate::lifecycle::Component;
use crate::protocol::{validate_segment, AgentRequest, ChatMessage, RoutingDecision, TopicBuilder};
use crate::store::{ConversationStore, SenderKind, StoredMessage};
use crate::transport::{handler_fn, Consumer, Envelope, Publisher, SubscriptionId};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn, Instrument};

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Routed { agent: String, topic: String },
    Clarification { question: String },
}

pub struct Dispatcher {
    consumer: Arc<Consumer>,
    publisher: Arc<Publisher>,
    classifier: Arc<dyn Classifier>,
    logger: BusLogger,
    system_prompt: String,
    fallback_agent: String,
    store: Option<Arc<dyn ConversationStore>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl Dispatcher {
    pub fn new(
        consumer: Arc<Consumer>,
        publisher: Arc<Publisher>,
        classifier: Arc<dyn Classifier>,
        logger: BusLogger,
        settings: &DispatcherSection,
    ) -> Self {
        Self {
            consumer,
            publisher,
            classifier,
            logger,
            system_prompt: settings
                .system_prompt
                .clone()
                .unwrap_or_else(|| MAIA_DISPATCHER_PROMPT.to_string()),
            fallback_agent: settings.fallback_agent.clone(),
            store: None,
            subscription: Mutex::new(None),
        }
    }

    /// Record every inbound user message in `store`
    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn fallback_agent(&self) -> &str {
        &self.fallback_agent
    }

    /// Subscribe to `user.message.new`. Calling it again returns the existing
    /// subscription.
    pub async fn start(self: &Arc<Self>) -> BusResult<SubscriptionId> {
        let mut subscription = self.subscription.lock().await;
        if let Some(id) = *subscription {
            debug!("Dispatcher already subscribed ({})", id);
            return Ok(id);
        }

        // Weak so the consumer's registry does not keep the dispatcher alive
        let dispatcher = Arc::downgrade(self);
        let handler = handler_fn(move |envelope| {
            let dispatcher = dispatcher.upgrade();
            async move {
                if let Some(dispatcher) = dispatcher {
                    dispatcher.handle_message(envelope).await;
                }
            }
        });

        let id = self
            .consumer
            .subscribe(&TopicBuilder::user_message_new(), handler)
            .await?;
        *subscription = Some(id);
        info!("Dispatcher listening on {}", TopicBuilder::user_message_new());
        Ok(id)
    }

    /// Unsubscribe and release both broker connections
    pub async fn stop(&self) {
        if let Some(id) = self.subscription.lock().await.take() {
            if !self.consumer.unsubscribe(id).await {
                warn!("Dispatcher subscription {} could not be removed", id);
            }
        }
        self.consumer.close().await;
        self.publisher.disconnect().await;
        info!("Dispatcher stopped");
    }

    /// Per-message entry point. Never fails: errors are logged and the
    /// message is dropped.
    pub async fn handle_message(&self, envelope: Envelope) {
        let span = crate::dispatch_span!(
            topic = %envelope.topic,
            delivery_tag = envelope.delivery_tag
        );
        async {
            match self.process(&envelope).await {
                Ok(outcome) => debug!(?outcome, "Message dispatched"),
                Err(e) => {
                    error!(error = %e, "Dispatch failed, message dropped");
                    self.logger
                        .error(format!("Error processing message: {e}"))
                        .await;
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Classify one message and publish the result.
    ///
    /// A clarification question is answered to the user only when the
    /// classifier selected no agent. With an agent selected the request is
    /// routed as usual and the question travels in the agent payload.
    pub async fn process(&self, envelope: &Envelope) -> DispatchResult<DispatchOutcome> {
        let message = ChatMessage::from_payload(&envelope.payload)
            .map_err(|e| DispatchError::invalid_payload(e.to_string()))?;
        self.remember(&message).await;

        let (decision, fields) = self.classify_message(&message.text).await?;

        if decision.selected().is_none() {
            if let Some(question) = decision.clarification() {
                return self.ask_user(message.chat_id, question).await;
            }
        }

        let agents = self.route_request(&decision);
        self.logger
            .info(format!("Selected agents: {agents:?}"))
            .await;
        let agent = agents
            .into_iter()
            .next()
            .ok_or_else(|| DispatchError::classification("no agent to route to"))?;

        let topic = TopicBuilder::agent_request(&agent);
        let payload = AgentRequest::wire_payload(message.chat_id, fields);
        if !self.publisher.publish(&topic, &payload).await {
            return Err(DispatchError::PublishFailed(topic));
        }

        info!(agent = %agent, "Routed request to {}", topic);
        Ok(DispatchOutcome::Routed { agent, topic })
    }

    /// Ask the classifier for a routing decision.
    ///
    /// Output that does not decode into a valid decision is an error; there
    /// is no partial routing.
    pub async fn analyze_request(&self, text: &str) -> DispatchResult<RoutingDecision> {
        self.classify_message(text)
            .await
            .map(|(decision, _)| decision)
    }

    // Decision plus the classifier's object as it arrived
    async fn classify_message(
        &self,
        text: &str,
    ) -> DispatchResult<(RoutingDecision, Map<String, Value>)> {
        let raw = self.classifier.classify(&self.system_prompt, text).await?;
        let (decision, fields) = RoutingDecision::parse_with_fields(&raw)?;

        self.logger
            .info(format!("Routing decision: {}", Value::Object(fields.clone())))
            .await;
        Ok((decision, fields))
    }

    async fn ask_user(
        &self,
        chat_id: Option<i64>,
        question: &str,
    ) -> DispatchResult<DispatchOutcome> {
        let reply = ChatMessage::new(chat_id, question);
        let topic = TopicBuilder::user_message_processed();
        if !self.publisher.publish(&topic, &reply).await {
            return Err(DispatchError::PublishFailed(topic));
        }
        self.logger
            .info(format!("Clarification requested: {question}"))
            .await;
        Ok(DispatchOutcome::Clarification {
            question: question.to_string(),
        })
    }

    /// Agents to publish to. Always exactly one entry: the selected agent, or
    /// the fallback when none was selected.
    pub fn route_request(&self, decision: &RoutingDecision) -> Vec<String> {
        match decision.selected() {
            Some(agent) => vec![agent.to_string()],
            None => vec![self.fallback_strategy(decision)],
        }
    }

    /// First usable secondary agent, else the configured fallback agent
    pub fn fallback_strategy(&self, decision: &RoutingDecision) -> String {
        let agent = decision
            .secondary_agents
            .iter()
            .map(|name| name.trim())
            .find(|name| validate_segment(name).is_ok())
            .unwrap_or(self.fallback_agent.as_str())
            .to_string();
        warn!(
            intent = %decision.primary_intent,
            "No agent selected, falling back to {}",
            agent
        );
        agent
    }

    async fn remember(&self, message: &ChatMessage) {
        let Some(store) = &self.store else {
            return;
        };
        let Some(chat_id) = message.chat_id else {
            debug!("Inbound message without chat_id not stored");
            return;
        };
        let stored = StoredMessage::new(SenderKind::User, message.text.clone());
        if !store.append(&chat_id.to_string(), stored).await {
            warn!(chat_id, "Conversation store rejected message");
        }
    }
}

#[async_trait]
impl Component for Arc<Dispatcher> {
    fn name(&self) -> &str {
        "dispatcher"
    }

    async fn launch(&self) -> BusResult<()> {
        self.publisher.connect().await?;
        self.start().await?;
        self.logger.info("Dispatcher started").await;
        Ok(())
    }

    async fn release(&self) {
        self.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::testing::mocks::MockClassifier;
    use crate::transport::InMemoryBroker;
    use serde_json::json;

    fn dispatcher(broker: &InMemoryBroker, classifier: MockClassifier) -> Dispatcher {
        let publisher = Arc::new(Publisher::new(
            Arc::new(broker.clone()),
            BrokerConfig::default(),
        ));
        let consumer = Arc::new(Consumer::new(
            Arc::new(broker.clone()),
            BrokerConfig::default(),
        ));
        let logger = BusLogger::new("dispatcher", publisher.clone());
        Dispatcher::new(
            consumer,
            publisher,
            Arc::new(classifier),
            logger,
            &DispatcherSection::default(),
        )
    }

    fn decision(value: serde_json::Value) -> RoutingDecision {
        serde_json::from_value(value).unwrap()
    }

    fn envelope(payload: serde_json::Value) -> Envelope {
        Envelope {
            topic: "user.message.new".to_string(),
            payload,
            delivery_tag: 1,
        }
    }

    #[test]
    fn test_route_prefers_selected_agent() {
        let broker = InMemoryBroker::new();
        let d = dispatcher(&broker, MockClassifier::new());

        let routes = d.route_request(&decision(json!({
            "selected_agent": "CalendarAgent",
            "secondary_agents": ["WeatherAgent"]
        })));
        assert_eq!(routes, vec!["CalendarAgent"]);
    }

    #[test]
    fn test_fallback_uses_first_valid_secondary() {
        let broker = InMemoryBroker::new();
        let d = dispatcher(&broker, MockClassifier::new());

        let routes = d.route_request(&decision(json!({
            "selected_agent": null,
            "secondary_agents": ["", "bad.name", "WeatherAgent", "SearchAgent"]
        })));
        assert_eq!(routes, vec!["WeatherAgent"]);
    }

    #[test]
    fn test_fallback_uses_configured_agent() {
        let broker = InMemoryBroker::new();
        let d = dispatcher(&broker, MockClassifier::new());

        let routes = d.route_request(&decision(json!({"selected_agent": "  "})));
        assert_eq!(routes, vec!["SearchAgent"]);
        assert_eq!(d.fallback_agent(), "SearchAgent");
    }

    #[tokio::test]
    async fn test_analyze_request_logs_decision() {
        let broker = InMemoryBroker::new();
        let d = dispatcher(
            &broker,
            MockClassifier::replying(r#"{"selected_agent": "WeatherAgent", "confidence_score": 0.9}"#),
        );

        let decision = d.analyze_request("Weather in Rome?").await.unwrap();

        assert_eq!(decision.selected(), Some("WeatherAgent"));
        let logs = broker.published_to("dispatcher.log.info");
        assert_eq!(logs.len(), 1);
        assert!(logs[0]["message"]
            .as_str()
            .unwrap()
            .starts_with("Routing decision:"));
    }

    #[tokio::test]
    async fn test_analyze_request_rejects_malformed_output() {
        let broker = InMemoryBroker::new();
        let d = dispatcher(&broker, MockClassifier::replying("WeatherAgent, probably"));

        let result = d.analyze_request("Weather in Rome?").await;
        assert!(matches!(result, Err(DispatchError::Classification(_))));
        assert!(broker.published_to("dispatcher.log.info").is_empty());
    }

    #[tokio::test]
    async fn test_process_routes_and_carries_chat_id() {
        let broker = InMemoryBroker::new();
        let d = dispatcher(
            &broker,
            MockClassifier::replying_json(&json!({
                "original_request": "Schedule a meeting tomorrow",
                "selected_agent": "CalendarAgent",
                "confidence_score": 0.9
            })),
        );

        let outcome = d
            .process(&envelope(json!({"chat_id": 441992716, "text": "Schedule a meeting tomorrow"})))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Routed {
                agent: "CalendarAgent".to_string(),
                topic: "agent.CalendarAgent.request".to_string()
            }
        );
        let requests = broker.published_to("agent.CalendarAgent.request");
        assert_eq!(requests[0]["chat_id"], 441992716);
        assert_eq!(requests[0]["selected_agent"], "CalendarAgent");
    }

    #[tokio::test]
    async fn test_process_forwards_classifier_fields_untouched() {
        let broker = InMemoryBroker::new();
        let d = dispatcher(
            &broker,
            MockClassifier::replying(
                r#"{"primary_intent": "schedule", "selected_agent": "CalendarAgent",
                    "confidence": 0.9, "language": "it",
                    "detected_entities": {"attendees": 3}}"#,
            ),
        );

        d.process(&envelope(json!({"chat_id": 1, "text": "Fissa una riunione"})))
            .await
            .unwrap();

        let requests = broker.published_to("agent.CalendarAgent.request");
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0],
            json!({
                "chat_id": 1,
                "primary_intent": "schedule",
                "selected_agent": "CalendarAgent",
                "confidence": 0.9,
                "language": "it",
                "detected_entities": {"attendees": 3}
            })
        );
    }

    #[tokio::test]
    async fn test_clarification_with_selected_agent_still_routes() {
        let broker = InMemoryBroker::new();
        let d = dispatcher(
            &broker,
            MockClassifier::replying_json(&json!({
                "selected_agent": "CalendarAgent",
                "requires_clarification": true,
                "clarification_question": "Which day?"
            })),
        );

        let outcome = d
            .process(&envelope(json!({"chat_id": 5, "text": "Book a meeting"})))
            .await
            .unwrap();

        assert!(matches!(outcome, DispatchOutcome::Routed { .. }));
        let requests = broker.published_to("agent.CalendarAgent.request");
        assert_eq!(requests[0]["clarification_question"], "Which day?");
        assert!(broker.published_to("user.message.processed").is_empty());
    }

    #[tokio::test]
    async fn test_missing_text_is_classified_as_sentinel() {
        let broker = InMemoryBroker::new();
        let classifier = Arc::new(MockClassifier::replying(r#"{"selected_agent": "SearchAgent"}"#));
        let publisher = Arc::new(Publisher::new(
            Arc::new(broker.clone()),
            BrokerConfig::default(),
        ));
        let d = Dispatcher::new(
            Arc::new(Consumer::new(Arc::new(broker.clone()), BrokerConfig::default())),
            publisher.clone(),
            classifier.clone(),
            BusLogger::new("dispatcher", publisher),
            &DispatcherSection::default(),
        );

        d.process(&envelope(json!({"chat_id": 1}))).await.unwrap();

        assert_eq!(classifier.calls()[0].1, crate::protocol::MISSING_TEXT);
    }

    #[tokio::test]
    async fn test_handle_message_logs_errors_and_publishes_nothing_else() {
        let broker = InMemoryBroker::new();
        let d = dispatcher(&broker, MockClassifier::replying("not json"));

        d.handle_message(envelope(json!({"chat_id": 1, "text": "hi"})))
            .await;

        let errors = broker.published_to("dispatcher.log.error");
        assert_eq!(errors.len(), 1);
        assert!(errors[0]["message"]
            .as_str()
            .unwrap()
            .starts_with("Error processing message"));
        assert!(broker
            .published()
            .iter()
            .all(|(topic, _)| topic == "dispatcher.log.error"));
    }
}
