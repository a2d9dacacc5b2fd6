//! Connection and channel behaviour against the in-process broker.

mod support;

use amqp_transport::protocol::{BasicProperties, BasicPublish, Method, QueueDeclare};
use amqp_transport::{ChannelState, Connection, ConnectionState, QosConfig, TransportError};
use bytes::Bytes;
use futures::StreamExt;
use support::{connected, test_config, MockBroker, Script};

fn declare(queue: &str) -> QueueDeclare {
    QueueDeclare {
        queue: queue.to_string(),
        ..Default::default()
    }
}

fn publish_to(queue: &str) -> BasicPublish {
    BasicPublish {
        exchange: String::new(),
        routing_key: queue.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_handshake_negotiates_and_authenticates() {
    let broker = MockBroker::default();
    let mut connection = connected(&broker, QosConfig::default()).await;

    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.tuning().frame_max, 4096);
    assert_eq!(connection.tuning().channel_max, 2047);

    let start_ok = broker
        .received()
        .into_iter()
        .find_map(|(_, m)| match m {
            Method::ConnectionStartOk(ok) => Some(ok),
            _ => None,
        })
        .unwrap();
    assert_eq!(start_ok.mechanism, "PLAIN");
    assert_eq!(&start_ok.response[..], b"\0guest\0guest");

    assert!(broker
        .received()
        .contains(&(0, Method::ConnectionOpen { virtual_host: "/".into() })));

    connection.disconnect(0, "").await.unwrap();
    assert_eq!(connection.state(), ConnectionState::NotConnected);
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let broker = MockBroker::default();
    let mut connection = connected(&broker, QosConfig::default()).await;

    let err = connection
        .connect_with_stream(broker.connect_duplex())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::AlreadyConnected));
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_disconnect_then_reconnect() {
    let broker = MockBroker::default();
    let mut connection = connected(&broker, QosConfig::default()).await;
    let channel = connection.channel().await.unwrap();

    connection.disconnect(0, "").await.unwrap();
    assert!(matches!(
        connection.disconnect(0, "").await,
        Err(TransportError::NotConnected)
    ));
    assert_eq!(channel.state().await, ChannelState::Closed);

    // Open channels were closed before Connection.Close.
    let received = broker.received();
    let channel_close = received
        .iter()
        .position(|(ch, m)| *ch == channel.id() && matches!(m, Method::ChannelClose(_)))
        .unwrap();
    let connection_close = received
        .iter()
        .position(|(_, m)| matches!(m, Method::ConnectionClose(_)))
        .unwrap();
    assert!(channel_close < connection_close);

    connection
        .connect_with_stream(broker.connect_duplex())
        .await
        .unwrap();
    assert_eq!(connection.state(), ConnectionState::Connected);
    let channel = connection.channel().await.unwrap();
    assert_eq!(channel.id(), 1);
}

#[tokio::test]
async fn test_channel_ids_and_qos() {
    let broker = MockBroker::default();
    let qos = QosConfig {
        prefetch_size: 0,
        prefetch_count: 10,
        global: false,
    };
    let connection = connected(&broker, qos).await;

    let first = connection.channel().await.unwrap();
    let second = connection.channel().await.unwrap();
    assert_eq!(first.id(), 1);
    assert_eq!(second.id(), 2);
    assert_eq!(first.state().await, ChannelState::Open);

    let qos_on_first = broker.received().into_iter().any(|(ch, m)| {
        ch == 1 && matches!(m, Method::BasicQos(q) if q.prefetch_count == 10)
    });
    assert!(qos_on_first);
}

#[tokio::test]
async fn test_channels_exhausted() {
    let broker = MockBroker::new(Script {
        channel_max: 2,
        ..Default::default()
    });
    let connection = connected(&broker, QosConfig::default()).await;

    connection.channel().await.unwrap();
    let second = connection.channel().await.unwrap();
    assert!(matches!(
        connection.channel().await,
        Err(TransportError::ChannelsExhausted(2))
    ));

    second.close(200, "bye").await.unwrap();
    assert_eq!(connection.channel().await.unwrap().id(), 2);
}

#[tokio::test]
async fn test_connection_close_fails_every_pending_operation() {
    // Answers Channel.Open, Basic.Qos and Confirm.Select, then swallows three
    // methods and force-closes the connection.
    let broker = MockBroker::new(Script::kill_after(3, 3));
    let connection = connected(&broker, QosConfig::default()).await;
    let channel = connection.channel().await.unwrap();
    channel.confirm_select().await.unwrap();

    let (opened, declared, published) = tokio::join!(
        connection.channel(),
        channel.queue_declare(declare("jobs")),
        channel.publish(publish_to("jobs"), BasicProperties::default(), Bytes::from_static(b"x")),
    );

    assert_eq!(opened.unwrap_err().reply_code(), Some(320));
    assert_eq!(declared.unwrap_err().reply_code(), Some(320));
    assert_eq!(published.unwrap_err().reply_code(), Some(320));

    let mut state = connection.watch_state();
    state
        .wait_for(|s| *s == ConnectionState::NotConnected)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_channel_close_is_scoped_to_its_channel() {
    let broker = MockBroker::default();
    let connection = connected(&broker, QosConfig::default()).await;
    let doomed = connection.channel().await.unwrap();
    let healthy = connection.channel().await.unwrap();

    let err = doomed
        .queue_declare(QueueDeclare {
            queue: "missing".into(),
            passive: true,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.reply_code(), Some(404));
    assert_eq!(doomed.state().await, ChannelState::Closed);
    assert!(matches!(
        doomed.queue_declare(declare("jobs")).await,
        Err(TransportError::ChannelClosed(1))
    ));

    let ok = healthy.queue_declare(declare("jobs")).await.unwrap();
    assert_eq!(ok.queue, "jobs");
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_large_body_get_round_trip() {
    let broker = MockBroker::default();
    let connection = connected(&broker, QosConfig::default()).await;
    let channel = connection.channel().await.unwrap();
    channel.queue_declare(declare("blobs")).await.unwrap();

    let body: Bytes = (0..10_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
    let props = BasicProperties {
        content_type: Some("application/octet-stream".into()),
        ..Default::default()
    };
    channel
        .publish(publish_to("blobs"), props, body.clone())
        .await
        .unwrap();

    // Frames on one connection are handled in order, so the publish has
    // landed before the get is read.
    let delivery = channel.get("blobs", false).await.unwrap().unwrap();
    assert_eq!(delivery.body, body);
    assert_eq!(delivery.routing_key, "blobs");
    assert_eq!(
        delivery.properties.content_type.as_deref(),
        Some("application/octet-stream")
    );
    channel.ack(delivery.delivery_tag, false).await.unwrap();

    assert!(channel.get("blobs", true).await.unwrap().is_none());
}

#[tokio::test]
async fn test_confirmed_publish() {
    let broker = MockBroker::default();
    let connection = connected(&broker, QosConfig::default()).await;
    let channel = connection.channel().await.unwrap();
    channel.queue_declare(declare("audit")).await.unwrap();
    channel.confirm_select().await.unwrap();

    for _ in 0..3 {
        channel
            .publish(publish_to("audit"), BasicProperties::default(), Bytes::from_static(b"entry"))
            .await
            .unwrap();
    }

    let purged = channel.queue_purge("audit").await.unwrap();
    assert_eq!(purged, 3);
}

#[tokio::test]
async fn test_consumer_stop_ends_stream() {
    let broker = MockBroker::default();
    let connection = connected(&broker, QosConfig::default()).await;
    let channel = connection.channel().await.unwrap();
    channel.queue_declare(declare("tasks")).await.unwrap();

    let consumer = channel.consume("tasks").await.unwrap();
    assert!(consumer.tag().starts_with("tasks-"));
    let (control, mut packages) = consumer.into_parts();

    channel
        .publish(publish_to("tasks"), BasicProperties::default(), Bytes::from_static(b"one"))
        .await
        .unwrap();
    let package = packages.next().await.unwrap();
    assert_eq!(&package.payload()[..], b"one");
    assert_eq!(package.queue(), "tasks");
    package.ack().await.unwrap();

    control.stop().await.unwrap();
    assert!(packages.next().await.is_none());
}

#[tokio::test]
async fn test_connect_refused_resets_state() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut config = test_config();
    config.host = "127.0.0.1".into();
    config.port = port;
    let mut connection = Connection::new(config, QosConfig::default());

    assert!(connection.connect().await.is_err());
    assert_eq!(connection.state(), ConnectionState::NotConnected);
}

#[tokio::test]
async fn test_connected_as_soon_as_connect_returns() {
    let broker = MockBroker::default();
    let mut connection = Connection::new(test_config(), QosConfig::default());

    connection
        .connect_with_stream(broker.connect_duplex())
        .await
        .unwrap();
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert!(connection.is_connected());

    let channel = connection.channel().await.unwrap();
    assert_eq!(channel.state().await, ChannelState::Open);
    connection.disconnect(0, "").await.unwrap();
}
