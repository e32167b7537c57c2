//! Exchange setup and routing end to end

use amqp_messaging::{
    ConnectionManager, ExchangeKind, InMemoryBroker, Message, Publisher, RoutingTable,
    TopologyCache,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
struct Order {
    id: u32,
}

impl Message for Order {}

fn publisher(broker: &InMemoryBroker) -> Publisher {
    Publisher::new(
        ConnectionManager::new(broker.connector()),
        Arc::new(TopologyCache::new()),
    )
}

#[tokio::test]
async fn test_fanout_reaches_every_queue() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker);

    let exchange = publisher
        .setup_fanout(&["mail", "audit", "billing"])
        .await
        .unwrap();
    assert_eq!(exchange, "f_audit_billing_mail");
    assert_eq!(broker.exchange_kind(&exchange), Some(ExchangeKind::Fanout));
    assert_eq!(broker.bindings(&exchange).len(), 3);

    // second setup is served from the cache
    publisher
        .setup_fanout(&["billing", "mail", "audit"])
        .await
        .unwrap();
    assert_eq!(broker.stats().exchange_declarations, 1);

    publisher
        .send_to_exchange(&Order { id: 1 }, &exchange, "")
        .await
        .unwrap();
    for queue in ["mail", "audit", "billing"] {
        assert_eq!(broker.queue_depth(queue), 1, "queue {}", queue);
    }
}

#[tokio::test]
async fn test_direct_routes_by_exact_key() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker);
    let routing = RoutingTable::new()
        .route("eu_orders", ["orders.eu"])
        .route_list("us_orders", "orders.us; orders.ca");

    let exchange = publisher.setup_direct(&routing).await.unwrap();
    assert_eq!(exchange, "d_eu_orders_us_orders");

    for key in ["orders.eu", "orders.ca", "orders.mx"] {
        publisher
            .send_to_exchange(&Order { id: 2 }, &exchange, key)
            .await
            .unwrap();
    }
    assert_eq!(broker.queue_depth("eu_orders"), 1);
    assert_eq!(broker.queue_depth("us_orders"), 1);
}

#[tokio::test]
async fn test_topic_routes_by_pattern() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker);
    let routing = RoutingTable::new()
        .route("everything", ["orders.#"])
        .route("eu_created", ["orders.eu.*"]);

    publisher
        .setup_topic_named("orders", &routing)
        .await
        .unwrap();
    assert_eq!(broker.exchange_kind("orders"), Some(ExchangeKind::Topic));

    for key in ["orders.eu.created", "orders.us.created", "orders"] {
        publisher
            .send_to_exchange(&Order { id: 3 }, "orders", key)
            .await
            .unwrap();
    }
    assert_eq!(broker.queue_depth("everything"), 3);
    assert_eq!(broker.queue_depth("eu_created"), 1);
}

#[tokio::test]
async fn test_batch_lands_on_type_named_queue() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker).with_batch_concurrency(4);
    let orders: Vec<Order> = (0..10).map(|id| Order { id }).collect();

    assert_eq!(publisher.send_batch(&orders, None).await.unwrap(), 10);
    assert_eq!(broker.queue_depth("Order"), 10);
    assert_eq!(broker.stats().queue_declarations, 1);
    assert_eq!(broker.open_connections(), 0);
}
