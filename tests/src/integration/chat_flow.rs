//! # Chat Flow
//!
//! A message published to the chat topic reaches exactly the listeners whose
//! subscription filter matches its `chatId`.
//!
//! ```text
//!   publish {chatId: X} ──→ topic chat-messages ──filter chatId = X──→ listener A
//!                                               ──filter chatId = Y──→ (nothing)
//! ```

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    use serde::Deserialize;
    use serde_json::json;

    use game_runtime::{ChatDirectory, GameRuntime, RuntimeConfig};
    use shared_pubsub::{
        InMemoryMessageBus, PubSubAsyncIterator, PubSubEngine, PublishOptions, SubscribeOptions,
        SubscriptionFilter, TopicConfig,
    };

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    const TOPIC: &str = "projects/game/topics/chat-messages";

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Said {
        chat_id: String,
        message: String,
    }

    fn chat_engine() -> (Arc<InMemoryMessageBus>, PubSubEngine) {
        let bus = Arc::new(InMemoryMessageBus::new());
        bus.create_topic(TOPIC);
        let engine = PubSubEngine::new(bus.clone(), TopicConfig::new("game", "chat-messages"))
            .expect("engine");
        (bus, engine)
    }

    fn listener(engine: &PubSubEngine, chat_id: &str) -> Arc<PubSubAsyncIterator<Said>> {
        let options = SubscribeOptions::default()
            .with_filter(SubscriptionFilter::key_equals("chatId", chat_id));
        Arc::new(engine.async_iterator_with_options(format!("chat-messages%chatId~{chat_id}"), options))
    }

    async fn wait_for_stream(bus: &InMemoryMessageBus, subscription: &str) {
        timeout(Duration::from_secs(1), async {
            while !bus.is_streaming(subscription) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("stream never opened");
    }

    // =============================================================================
    // INTEGRATION TESTS: ENGINE → BUS → ITERATOR
    // =============================================================================

    /// Only the matching chat's message reaches the listener.
    #[tokio::test]
    async fn test_filtered_delivery_to_single_listener() {
        let (bus, engine) = chat_engine();
        let a = listener(&engine, "X");
        let reader = tokio::spawn({
            let a = Arc::clone(&a);
            async move { a.next().await }
        });
        wait_for_stream(&bus, "projects/game/subscriptions/chat-messages%chatId~X").await;

        engine
            .publish(PublishOptions::new(json!({"chatId": "Y", "message": "nope"})))
            .await
            .unwrap();
        engine
            .publish(PublishOptions::new(json!({"chatId": "X", "message": "hi"})))
            .await
            .unwrap();

        let received = timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            received,
            Some(Said {
                chat_id: "X".into(),
                message: "hi".into()
            })
        );

        // Nothing else is waiting for A.
        assert!(timeout(Duration::from_millis(50), a.next()).await.is_err());
        assert_eq!(
            bus.backlog_len("projects/game/subscriptions/chat-messages%chatId~X"),
            0
        );
        a.cancel().await.unwrap();
    }

    /// Two chats, two listeners: each sees only its own traffic.
    #[tokio::test]
    async fn test_listeners_are_isolated_per_chat() {
        let (bus, engine) = chat_engine();
        let x = listener(&engine, "X");
        let y = listener(&engine, "Y");
        let x_reader = tokio::spawn({
            let x = Arc::clone(&x);
            async move { x.next().await }
        });
        let y_reader = tokio::spawn({
            let y = Arc::clone(&y);
            async move { y.next().await }
        });
        wait_for_stream(&bus, "projects/game/subscriptions/chat-messages%chatId~X").await;
        wait_for_stream(&bus, "projects/game/subscriptions/chat-messages%chatId~Y").await;

        for (chat_id, message) in [("Y", "to y"), ("X", "to x")] {
            engine
                .publish(PublishOptions::new(json!({"chatId": chat_id, "message": message})))
                .await
                .unwrap();
        }

        let x_got = timeout(Duration::from_secs(1), x_reader).await.unwrap().unwrap();
        let y_got = timeout(Duration::from_secs(1), y_reader).await.unwrap().unwrap();
        assert_eq!(x_got.unwrap().map(|s| s.message), Some("to x".to_string()));
        assert_eq!(y_got.unwrap().map(|s| s.message), Some("to y".to_string()));

        x.cancel().await.unwrap();
        y.cancel().await.unwrap();
        assert!(bus.subscription_names().is_empty());
    }

    // =============================================================================
    // INTEGRATION TESTS: GAME RUNTIME
    // =============================================================================

    /// A chat member's message reaches another member through the runtime.
    #[tokio::test]
    async fn test_runtime_chat_round_trip() {
        let mut config = RuntimeConfig::default();
        config.pubsub.project_id = "game".to_string();
        let directory = Arc::new(ChatDirectory::new());
        directory.open_chat("c1");
        directory.add_member("c1", "acct-alice", "alice");
        directory.add_member("c1", "acct-bob", "bob");
        let runtime = GameRuntime::new(config, directory).unwrap();

        let bob = Arc::new(
            runtime
                .chat()
                .subscribe_chat_messages("c1", "acct-bob")
                .await
                .unwrap(),
        );
        let reader = tokio::spawn({
            let bob = Arc::clone(&bob);
            async move { bob.next().await }
        });
        wait_for_stream(
            runtime.bus(),
            "projects/game/subscriptions/chat-messages%chatId~c1%toPlayer~bob",
        )
        .await;

        let sent = runtime
            .chat()
            .publish_chat_message("c1", "acct-alice", "gg")
            .await
            .unwrap();
        let event = timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .expect("bob should receive the message");
        assert_eq!(event.chat_messages, sent);
        assert_eq!(event.chat_messages.from_player_id, "alice");

        bob.cancel().await.unwrap();
        assert_eq!(runtime.chat_stats().live_subscriptions, 0);
        assert_eq!(runtime.chat_stats().messages_delivered, 1);
    }
}
