// End-to-end behaviour of the messenger against the in-process broker.

use std::sync::Arc;
use std::time::Duration;

use fleet_messenger::{
    Broker, Connection, DisposePolicy, ErrorReply, Exchange, MemoryBroker, Message,
    MessageProperties, MessageType, MessengerError, MessengerService, MessengerSettings,
    PublishOptions, SubscriptionState, TypeRegistry,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Echo {
    n: u32,
}

impl MessageType for Echo {
    const TYPE_NAME: &'static str = "Echo";
}

fn settings() -> MessengerSettings {
    MessengerSettings {
        request_timeout: Duration::from_secs(1),
        dispose: DisposePolicy {
            retry_delay: Duration::from_millis(10),
            max_retries: 3,
        },
    }
}

async fn started(broker: &MemoryBroker) -> MessengerService {
    let mut registry = TypeRegistry::new();
    registry.register::<Echo>();
    let connection = Arc::new(Connection::new(Arc::new(broker.clone()), "integration"));
    let messenger = MessengerService::new(connection, Arc::new(registry), settings())
        .with_exchange(Exchange::topic("on.task"));
    messenger.start().await.expect("start");
    messenger
}

async fn next(receiver: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    timeout(Duration::from_secs(1), receiver.recv())
        .await
        .expect("message within a second")
        .expect("channel open")
}

async fn echo_responder(messenger: &MessengerService) {
    messenger
        .subscribe("rpc", "echo", |message: Message| {
            tokio::spawn(async move {
                let result = match message.data::<Echo>() {
                    Some(echo) => message.respond(echo).await,
                    None => {
                        message
                            .respond_error(&ErrorReply::new("BadRequest", "expected Echo"))
                            .await
                    }
                };
                result.expect("respond");
            });
        })
        .await
        .expect("responder");
}

#[tokio::test]
async fn test_topic_subscription_only_sees_matching_keys() {
    let broker = MemoryBroker::new();
    let messenger = started(&broker).await;
    let (sender, mut receiver) = mpsc::unbounded_channel();
    messenger
        .subscribe("on.task", "a.*", move |message| {
            let _ = sender.send(message);
        })
        .await
        .expect("subscribe");

    messenger
        .publish("on.task", "c.d", &json!({ "skip": true }), PublishOptions::new())
        .await
        .expect("publish c.d");
    messenger
        .publish(
            "on.task",
            "a.b",
            &Echo { n: 1 },
            PublishOptions::typed::<Echo>().with_header("trace", "t-1"),
        )
        .await
        .expect("publish a.b");

    let message = next(&mut receiver).await;
    assert_eq!(message.exchange(), "on.task");
    assert_eq!(message.routing_key(), "a.b");
    assert_eq!(message.data::<Echo>(), Some(&Echo { n: 1 }));
    assert_eq!(message.headers().get("trace").map(String::as_str), Some("t-1"));
    assert!(receiver.try_recv().is_err());
}

#[tokio::test]
async fn test_malformed_deliveries_are_skipped() {
    let broker = MemoryBroker::new();
    let messenger = started(&broker).await;
    let (sender, mut receiver) = mpsc::unbounded_channel();
    messenger
        .subscribe("on.task", "task.#", move |message| {
            let _ = sender.send(message);
        })
        .await
        .expect("subscribe");

    let (raw, _events) = broker.connect("raw");
    raw.publish("on.task", "task.bad", b"not json".to_vec(), MessageProperties::default())
        .await
        .expect("raw publish");
    raw.publish("on.task", "task.empty", Vec::new(), MessageProperties::default())
        .await
        .expect("raw publish");
    messenger
        .publish("on.task", "task.good", &json!({ "ok": true }), PublishOptions::new())
        .await
        .expect("publish");

    let message = next(&mut receiver).await;
    assert_eq!(message.routing_key(), "task.good");
    assert_eq!(message.json(), &json!({ "ok": true }));
}

#[tokio::test]
async fn test_disposed_subscription_stops_delivering() {
    let broker = MemoryBroker::new();
    let messenger = started(&broker).await;
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let subscription = messenger
        .subscribe("on.task", "#", move |message| {
            let _ = sender.send(message);
        })
        .await
        .expect("subscribe");

    assert!(subscription.dispose().await.expect("dispose"));
    assert!(subscription.dispose().await.expect("dispose again"));
    assert_eq!(subscription.state(), SubscriptionState::Disposed);

    let stats = broker.stats();
    assert_eq!((stats.unsubscribes, stats.destroys, stats.closes), (1, 1, 1));
    assert_eq!(broker.consumer_count(), 0);

    messenger
        .publish("on.task", "late", &json!({}), PublishOptions::new())
        .await
        .expect("publish");
    assert!(timeout(Duration::from_millis(50), receiver.recv())
        .await
        .map_or(true, |message| message.is_none()));
}

#[tokio::test]
async fn test_request_receives_reply() {
    let broker = MemoryBroker::new();
    let messenger = started(&broker).await;
    echo_responder(&messenger).await;

    let reply = messenger
        .request("rpc", "echo", &Echo { n: 7 }, Some(Echo::TYPE_NAME), None)
        .await
        .expect("reply");

    assert_eq!(reply.deserialize::<Echo>().expect("echo"), Echo { n: 7 });
    assert!(reply.correlation_id().is_some());
    // only the responder's consumer remains
    assert_eq!(broker.consumer_count(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_get_their_own_replies() {
    let broker = MemoryBroker::new();
    let messenger = started(&broker).await;
    echo_responder(&messenger).await;

    let requests = (0..10).map(|n| {
        let messenger = &messenger;
        async move {
            let reply = messenger
                .request("rpc", "echo", &Echo { n }, Some(Echo::TYPE_NAME), None)
                .await?;
            Ok::<_, MessengerError>((n, reply.deserialize::<Echo>()?))
        }
    });

    for result in futures::future::join_all(requests).await {
        let (sent, received) = result.expect("request");
        assert_eq!(received, Echo { n: sent });
    }
    assert_eq!(broker.consumer_count(), 1);
}

#[tokio::test]
async fn test_reply_with_foreign_correlation_id_is_ignored() {
    let broker = MemoryBroker::new();
    let messenger = started(&broker).await;
    let (stranger, _events) = broker.connect("stranger");

    messenger
        .subscribe("rpc", "echo", move |message: Message| {
            let stranger = stranger.clone();
            tokio::spawn(async move {
                let reply_to = message.reply_to().expect("reply_to").to_owned();
                let decoy = MessageProperties {
                    correlation_id: Some("someone-else".into()),
                    message_type: Some(Echo::TYPE_NAME.into()),
                    ..MessageProperties::default()
                };
                stranger
                    .publish("", &reply_to, br#"{"n":999}"#.to_vec(), decoy)
                    .await
                    .expect("decoy");
                let echo = message.data::<Echo>().expect("echo").clone();
                message.respond(&echo).await.expect("respond");
            });
        })
        .await
        .expect("responder");

    let reply = messenger
        .request("rpc", "echo", &Echo { n: 7 }, Some(Echo::TYPE_NAME), None)
        .await
        .expect("reply");
    assert_eq!(reply.deserialize::<Echo>().expect("echo"), Echo { n: 7 });
    assert_ne!(reply.correlation_id(), Some("someone-else"));
}

#[tokio::test]
async fn test_error_reply_becomes_remote_error() {
    let broker = MemoryBroker::new();
    let messenger = started(&broker).await;
    echo_responder(&messenger).await;

    let err = messenger
        .request("rpc", "echo", &json!({ "wrong": true }), None, None)
        .await
        .expect_err("remote error");

    match err {
        MessengerError::RemoteError { name, message } => {
            assert_eq!(name, "BadRequest");
            assert_eq!(message, "expected Echo");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_request_timeout_releases_reply_queue() {
    let broker = MemoryBroker::new();
    let messenger = started(&broker).await;

    let err = messenger
        .request(
            "rpc",
            "nobody.home",
            &json!({}),
            None,
            Some(Duration::from_millis(50)),
        )
        .await
        .expect_err("timeout");

    assert!(matches!(
        err,
        MessengerError::RequestTimedOut { timeout: waited, .. } if waited == Duration::from_millis(50)
    ));
    assert_eq!(broker.consumer_count(), 0);
    assert_eq!(broker.queue_count(), 0);
}

#[tokio::test]
async fn test_messenger_can_restart_after_stop() {
    let broker = MemoryBroker::new();
    let messenger = started(&broker).await;

    messenger.stop().await.expect("stop");
    assert!(!messenger.connection().is_connected());
    assert!(matches!(
        messenger.stop().await,
        Err(MessengerError::NotStarted)
    ));

    messenger.start().await.expect("restart");
    assert!(messenger.connection().is_connected());
    assert_eq!(broker.stats().connects, 2);
    // the exchange cache was cleared, so the restart declared again
    assert_eq!(broker.exchange_declarations("on.task"), 2);
}

#[tokio::test]
async fn test_connection_gives_up_after_max_retries() {
    let broker = MemoryBroker::new();
    broker.refuse_connects(61);
    let connection = Arc::new(Connection::new(Arc::new(broker.clone()), "integration"));
    let messenger = MessengerService::new(connection, Arc::new(TypeRegistry::new()), settings());

    let err = messenger.start().await.expect_err("start");
    assert!(matches!(err, MessengerError::MaxRetriesExceeded { retries: 61 }));
    assert!(!messenger.connection().initial_connection_established());
    assert!(matches!(
        messenger.stop().await,
        Err(MessengerError::NotStarted)
    ));
}
