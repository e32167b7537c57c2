//! Round trips against a real broker
//!
//! Run with `cargo test -p amqp-messaging -- --ignored` (requires Docker).

use amqp_messaging::{
    handler_fn, AmqpConnector, ConnectionManager, Message, MessageService,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::assertions::eventually;
use test_utils::{TestDataBuilder, TestRabbitMq};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Greeting {
    id: String,
    name: String,
}

impl Message for Greeting {}

fn service(broker: &TestRabbitMq) -> MessageService {
    let connector = Arc::new(AmqpConnector::from_config(&broker.config()));
    MessageService::new(ConnectionManager::new(connector))
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_queue_round_trip() {
    let broker = TestRabbitMq::new().await;
    let builder = TestDataBuilder::from_test_name("test_queue_round_trip");
    let queue = builder.queue("greetings");
    let service = service(&broker);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let session = service.register_consume_async::<Greeting, _>(
        handler_fn("collect", move |greeting: Greeting| {
            sink.lock().unwrap().push(greeting);
            Ok(())
        }),
        Some(queue.as_str()),
        true,
        0,
    );

    let greeting = Greeting {
        id: "7".into(),
        name: "X".into(),
    };
    // consumer declares the queue; publish once it exists
    eventually("consumer", Duration::from_secs(10), || {
        service.consumers().is_registered::<Greeting>(Some(queue.as_str()))
    })
    .await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    service
        .publish(greeting.clone(), Some(queue.as_str()))
        .await
        .unwrap()
        .unwrap();

    eventually("delivery", Duration::from_secs(10), || {
        !received.lock().unwrap().is_empty()
    })
    .await;
    assert_eq!(received.lock().unwrap()[0], greeting);

    assert!(service.unregister_consume::<Greeting>(Some(queue.as_str())));
    assert!(session.await.unwrap().unwrap());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_fanout_on_real_broker() {
    let broker = TestRabbitMq::new().await;
    let builder = TestDataBuilder::from_test_name("test_fanout_on_real_broker");
    let (mail, audit) = (builder.queue("mail"), builder.queue("audit"));
    let service = service(&broker);
    let publisher = service.publisher();

    let exchange = publisher
        .setup_fanout(&[mail.as_str(), audit.as_str()])
        .await
        .unwrap();
    publisher
        .send_to_exchange(
            &Greeting {
                id: "1".into(),
                name: "fan".into(),
            },
            &exchange,
            "",
        )
        .await
        .unwrap();

    for queue in [&mail, &audit] {
        let received = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&received);
        let session = service.register_consume_async::<Greeting, _>(
            handler_fn("count", move |_: Greeting| {
                *counter.lock().unwrap() += 1;
                Ok(())
            }),
            Some(queue.as_str()),
            true,
            0,
        );
        eventually("delivery", Duration::from_secs(10), || {
            *received.lock().unwrap() == 1
        })
        .await;
        service.unregister_consume::<Greeting>(Some(queue.as_str()));
        assert!(session.await.unwrap().unwrap());
    }
}
