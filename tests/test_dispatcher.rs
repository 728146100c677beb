//! Dispatcher behavior over the bus
//!
//! Messages enter on `user.message.new` exactly as the chat front-end would
//! send them; assertions are made on what the in-process exchange saw.


use maia::agent::{AgentHandler, AgentWorker};
use maia::bus_logger::BusLogger;
use maia::config::DispatcherSection;
use maia::dispatch::{DispatchOutcome, Dispatcher};
use maia::error::DispatchResult;
use maia::protocol::{AgentRequest, RoutingDecision, TopicBuilder};
use maia::store::{ConversationStore, InMemoryConversationStore, SenderKind};
use maia::testing::{MockClassifier, RecordingHandler};
use maia::transport::InMemoryBroker;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;

fn calendar_decision() -> serde_json::Value {
    json!({
        "original_request": "Schedule a meeting tomorrow",
        "detected_primary_intent": "calendar_event_creation",
        "detected_entities": {"time": "tomorrow"},
        "selected_agent": "CalendarAgent",
        "confidence_score": 0.9,
        "secondary_agents": [],
        "requires_clarification": false,
        "clarification_question": null,
        "context_to_forward": "Create a meeting for tomorrow"
    })
}

#[tokio::test]
async fn test_scenario_routes_to_selected_agent() {
    let broker = InMemoryBroker::new();
    let classifier = Arc::new(MockClassifier::replying_json(&calendar_decision()));
    let dispatcher = test_dispatcher(&broker, classifier.clone());
    dispatcher.start().await.unwrap();

    let calendar = RecordingHandler::new();
    let watcher = test_consumer(&broker);
    watcher
        .subscribe("agent.CalendarAgent.request", calendar.clone())
        .await
        .unwrap();

    let publisher = test_publisher(&broker);
    assert!(
        publisher
            .publish(
                "user.message.new",
                &json!({"chat_id": 441992716, "text": "Schedule a meeting tomorrow"}),
            )
            .await
    );

    assert!(calendar.wait_for(1, DELIVERY_TIMEOUT).await);
    let request = &calendar.received()[0].payload;
    assert_eq!(request["chat_id"], 441992716);
    assert_eq!(request["selected_agent"], "CalendarAgent");
    assert_eq!(request["confidence_score"], 0.9);
    assert_eq!(request["context_to_forward"], "Create a meeting for tomorrow");

    let info: Vec<String> = broker
        .published_to("dispatcher.log.info")
        .iter()
        .filter_map(|r| r["message"].as_str().map(str::to_string))
        .collect();
    assert!(info.iter().any(|m| m.starts_with("Routing decision:")));
    assert!(info.contains(&"Selected agents: [\"CalendarAgent\"]".to_string()));

    assert_eq!(classifier.calls()[0].1, "Schedule a meeting tomorrow");

    watcher.close().await;
    dispatcher.stop().await;
}

#[tokio::test]
async fn test_scenario_undecodable_classification_is_dropped() {
    let broker = InMemoryBroker::new();
    let classifier = Arc::new(MockClassifier::replying("I'd say CalendarAgent."));
    let dispatcher = test_dispatcher(&broker, classifier);
    dispatcher.start().await.unwrap();

    let publisher = test_publisher(&broker);
    publisher
        .publish("user.message.new", &json!({"chat_id": 1, "text": "hello"}))
        .await;

    assert!(
        eventually(DELIVERY_TIMEOUT, || !broker
            .published_to("dispatcher.log.error")
            .is_empty())
        .await
    );
    assert!(broker
        .published()
        .iter()
        .all(|(topic, _)| !topic.starts_with("agent.")));

    dispatcher.stop().await;
}

#[tokio::test]
async fn test_null_selection_routes_to_fallback() {
    let broker = InMemoryBroker::new();
    let classifier = Arc::new(MockClassifier::replying_json(&json!({
        "original_request": "tell me something",
        "selected_agent": null,
        "confidence_score": 0.3,
        "secondary_agents": []
    })));
    let dispatcher = test_dispatcher(&broker, classifier);

    let decision: RoutingDecision =
        RoutingDecision::parse(r#"{"selected_agent": null}"#).unwrap();
    let routes = dispatcher.route_request(&decision);
    assert_eq!(routes, vec![dispatcher.fallback_strategy(&decision)]);
    assert_eq!(routes, vec!["SearchAgent"]);

    dispatcher.start().await.unwrap();
    test_publisher(&broker)
        .publish("user.message.new", &json!({"chat_id": 5, "text": "tell me something"}))
        .await;

    assert!(
        eventually(DELIVERY_TIMEOUT, || !broker
            .published_to("agent.SearchAgent.request")
            .is_empty())
        .await
    );

    dispatcher.stop().await;
}

#[tokio::test]
async fn test_configured_fallback_agent() {
    let broker = InMemoryBroker::new();
    let publisher = Arc::new(test_publisher(&broker));
    let dispatcher = Dispatcher::new(
        Arc::new(test_consumer(&broker)),
        publisher.clone(),
        Arc::new(MockClassifier::new()),
        BusLogger::new("dispatcher", publisher),
        &DispatcherSection {
            fallback_agent: "WeatherAgent".to_string(),
            system_prompt: Some("route please".to_string()),
        },
    );

    let decision = RoutingDecision::parse("{}").unwrap();
    assert_eq!(dispatcher.route_request(&decision), vec!["WeatherAgent"]);
}

#[tokio::test]
async fn test_clarification_goes_back_to_user() {
    let broker = InMemoryBroker::new();
    let classifier = Arc::new(MockClassifier::replying_json(&json!({
        "original_request": "Remind me about the meeting",
        "selected_agent": null,
        "confidence_score": 0.65,
        "requires_clarification": true,
        "clarification_question": "Which meeting do you mean?"
    })));
    let dispatcher = test_dispatcher(&broker, classifier);

    let outcome = dispatcher
        .process(&maia::transport::Envelope {
            topic: "user.message.new".to_string(),
            payload: json!({"chat_id": 9, "text": "Remind me about the meeting"}),
            delivery_tag: 1,
        })
        .await
        .unwrap();

    assert_eq!(
        outcome,
        DispatchOutcome::Clarification {
            question: "Which meeting do you mean?".to_string()
        }
    );
    let replies = broker.published_to("user.message.processed");
    assert_eq!(replies, vec![json!({"chat_id": 9, "text": "Which meeting do you mean?"})]);
    assert!(broker
        .published()
        .iter()
        .all(|(topic, _)| !topic.starts_with("agent.")));
}

#[tokio::test]
async fn test_extra_classifier_fields_reach_the_agent() {
    let broker = InMemoryBroker::new();
    let classifier = Arc::new(MockClassifier::replying_json(&json!({
        "primary_intent": "weather_query",
        "entities": {"city": "Roma", "days": 3},
        "selected_agent": "WeatherAgent",
        "confidence": 0.8,
        "language": "it",
        "requires_clarification": true,
        "clarification_question": "Oggi o domani?"
    })));
    let dispatcher = test_dispatcher(&broker, classifier);
    dispatcher.start().await.unwrap();

    let weather = RecordingHandler::new();
    let watcher = test_consumer(&broker);
    watcher
        .subscribe("agent.WeatherAgent.request", weather.clone())
        .await
        .unwrap();

    test_publisher(&broker)
        .publish(
            "user.message.new",
            &json!({"chat_id": "77", "text": "Che tempo fa a Roma?"}),
        )
        .await;

    assert!(weather.wait_for(1, DELIVERY_TIMEOUT).await);
    let request = &weather.received()[0].payload;
    assert_eq!(request["chat_id"], 77);
    assert_eq!(request["language"], "it");
    assert_eq!(request["primary_intent"], "weather_query");
    assert_eq!(request["entities"]["days"], 3);
    assert_eq!(request["clarification_question"], "Oggi o domani?");
    assert!(request.get("detected_primary_intent").is_none());
    assert!(broker.published_to("user.message.processed").is_empty());

    let decoded: AgentRequest = serde_json::from_value(request.clone()).unwrap();
    assert_eq!(decoded.chat_id, Some(77));
    assert_eq!(decoded.decision.entities["days"], "3");

    watcher.close().await;
    dispatcher.stop().await;
}

#[tokio::test]
async fn test_start_is_idempotent_and_stop_cleans_up() {
    let broker = InMemoryBroker::new();
    let dispatcher = test_dispatcher(&broker, Arc::new(MockClassifier::new()));

    let first = dispatcher.start().await.unwrap();
    let second = dispatcher.start().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(broker.queue_names().len(), 1);
    assert!(broker.queue_names()[0].starts_with("maia.user_message_new."));

    dispatcher.stop().await;
    assert!(broker.queue_names().is_empty());
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_inbound_messages_are_stored() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryConversationStore::new());
    let publisher = Arc::new(test_publisher(&broker));
    let dispatcher = Dispatcher::new(
        Arc::new(test_consumer(&broker)),
        publisher.clone(),
        Arc::new(MockClassifier::replying_json(&calendar_decision())),
        BusLogger::new("dispatcher", publisher),
        &DispatcherSection::default(),
    )
    .with_store(store.clone());

    dispatcher
        .process(&maia::transport::Envelope {
            topic: "user.message.new".to_string(),
            payload: json!({"chat_id": 441992716, "text": "Schedule a meeting tomorrow"}),
            delivery_tag: 1,
        })
        .await
        .unwrap();

    let history = store.history("441992716").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].sender, SenderKind::User);
    assert_eq!(history[0].text, "Schedule a meeting tomorrow");
}

struct CannedAgent;

#[async_trait::async_trait]
impl AgentHandler for CannedAgent {
    async fn handle(&self, request: &AgentRequest) -> DispatchResult<String> {
        Ok(format!("Done: {}", request.prompt_text()))
    }
}

#[tokio::test]
async fn test_end_to_end_reply_reaches_user() {
    let broker = InMemoryBroker::new();
    let dispatcher = test_dispatcher(
        &broker,
        Arc::new(MockClassifier::replying_json(&calendar_decision())),
    );
    dispatcher.start().await.unwrap();

    let agent_publisher = Arc::new(test_publisher(&broker));
    let agent = Arc::new(
        AgentWorker::new(
            "CalendarAgent",
            Arc::new(test_consumer(&broker)),
            agent_publisher.clone(),
            Arc::new(CannedAgent),
            BusLogger::new("CalendarAgent", agent_publisher),
        )
        .unwrap(),
    );
    agent.start().await.unwrap();

    let frontend = test_consumer(&broker);
    let replies = RecordingHandler::new();
    frontend
        .subscribe(&TopicBuilder::user_message_processed(), replies.clone())
        .await
        .unwrap();

    test_publisher(&broker)
        .publish(
            &TopicBuilder::user_message_new(),
            &json!({"chat_id": 441992716, "text": "Schedule a meeting tomorrow"}),
        )
        .await;

    assert!(replies.wait_for(1, DELIVERY_TIMEOUT).await);
    assert_eq!(
        replies.received()[0].payload,
        json!({"chat_id": 441992716, "text": "Done: Create a meeting for tomorrow"})
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    frontend.close().await;
    agent.stop().await;
    dispatcher.stop().await;
    assert!(broker.queue_names().is_empty());
}
