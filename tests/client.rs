mod common;

use std::time::Duration;

use bytes::Bytes;
use common::FakeBroker;
use mqtt_spool_client::config::{ChangeKind, ConfigChange, DeviceConfig, WatchConfigStore};
use mqtt_spool_client::{Error, MqttClientBuilder, QosLevel};

async fn client_with_broker() -> (mqtt_spool_client::MqttClient, std::sync::Arc<FakeBroker>) {
    let broker = FakeBroker::new();
    let client = MqttClientBuilder::new()
        .build_with_factory("device-a".to_owned(), broker.factory())
        .await
        .unwrap();
    (client, broker)
}

#[tokio::test]
async fn build_requires_thing_name_and_endpoint_for_the_tls_path() {
    let result = MqttClientBuilder::new().build().await;
    assert!(matches!(result, Err(Error::ThingName)));

    let result = MqttClientBuilder::new().thing_name("device-a").build().await;
    assert!(matches!(result, Err(Error::Endpoint)));
}

#[tokio::test]
async fn fresh_client_is_connected() {
    let (client, _broker) = client_with_broker().await;
    assert!(client.connected());
}

#[tokio::test]
async fn overlapping_subscribe_consolidates_onto_one_broker_filter() {
    let (client, broker) = client_with_broker().await;

    let _wide = client.subscribe("A/B/+", QosLevel::AtLeastOnce).await.unwrap();
    let _narrow = client.subscribe("A/B/C", QosLevel::AtLeastOnce).await.unwrap();

    let client_id = broker.client_ids().into_iter().next().unwrap();
    let subs = broker.subscriptions_for(&client_id);
    assert_eq!(subs.len(), 1);
    assert!(subs.contains("A/B/+"));
}

#[tokio::test]
async fn distinct_filters_each_get_a_broker_subscribe() {
    let (client, broker) = client_with_broker().await;

    client.subscribe("x/1", QosLevel::AtLeastOnce).await.unwrap();
    client.subscribe("x/2", QosLevel::AtLeastOnce).await.unwrap();

    let client_id = broker.client_ids().into_iter().next().unwrap();
    let subs = broker.subscriptions_for(&client_id);
    assert_eq!(subs.len(), 2);
}

#[tokio::test]
async fn unsubscribe_removes_the_broker_filter_when_no_local_subscriber_remains() {
    let (client, broker) = client_with_broker().await;

    client.subscribe("x/1", QosLevel::AtLeastOnce).await.unwrap();
    client.unsubscribe("x/1").await.unwrap();

    let client_id = broker.client_ids().into_iter().next().unwrap();
    assert!(broker.subscriptions_for(&client_id).is_empty());
}

#[tokio::test]
async fn pool_grows_once_a_connection_exhausts_its_subscription_capacity() {
    let (client, broker) = client_with_broker().await;

    for i in 0..mqtt_spool_client::limits::MAX_SUBSCRIPTIONS_PER_CONNECTION + 1 {
        client.subscribe(&format!("load/{i}"), QosLevel::AtLeastOnce).await.unwrap();
    }

    assert!(broker.connection_count() >= 2);
}

#[tokio::test]
async fn incoming_message_is_delivered_to_the_matching_subscriber() {
    let (client, broker) = client_with_broker().await;

    let mut sub = client.subscribe("telemetry/#", QosLevel::AtLeastOnce).await.unwrap();
    let client_id = broker.client_ids().into_iter().next().unwrap();

    broker.deliver(
        &client_id,
        mqtt_spool_client::Publish {
            topic: "telemetry/temp".to_owned(),
            payload: Bytes::from_static(b"21.5"),
            qos: QosLevel::AtLeastOnce,
            retain: false,
        },
    );

    let received = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
    assert_eq!(received.topic, "telemetry/temp");
}

#[tokio::test]
async fn publish_reaches_the_broker_once_the_publisher_loop_drains_the_spool() {
    let (client, broker) = client_with_broker().await;

    client
        .publish("status", QosLevel::AtLeastOnce, false, Bytes::from_static(b"ok"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.total_publish_count(), 1);
}

#[tokio::test]
async fn publish_rejects_oversized_payload() {
    let (client, _broker) = client_with_broker().await;
    let oversized = Bytes::from(vec![0u8; mqtt_spool_client::limits::DEFAULT_MQTT_MAX_OF_MESSAGE_SIZE_IN_BYTES + 1]);

    let result = client.publish("status", QosLevel::AtLeastOnce, false, oversized).await;
    assert!(matches!(result, Err(Error::InvalidRequest(_))));
}

#[tokio::test]
async fn publish_rejects_wildcard_topic() {
    let (client, _broker) = client_with_broker().await;
    let result = client.publish("status/#", QosLevel::AtLeastOnce, false, Bytes::from_static(b"x")).await;
    assert!(matches!(result, Err(Error::InvalidRequest(_))));
}

#[tokio::test]
async fn offline_qos0_publish_is_dropped() {
    let (client, broker) = client_with_broker().await;
    let client_id = broker.client_ids().into_iter().next().unwrap();

    broker.interrupt(&client_id, "network unreachable");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!client.connected());

    let result = client.publish("status", QosLevel::AtMostOnce, false, Bytes::from_static(b"x")).await;
    assert!(matches!(result, Err(Error::OfflineDrop)));
}

#[tokio::test]
async fn publish_retries_past_a_transient_failure_then_succeeds() {
    let (client, broker) = client_with_broker().await;
    let client_id = broker.client_ids().into_iter().next().unwrap();
    broker.set_fail_next_publishes(&client_id, 2);

    client
        .publish("status", QosLevel::AtLeastOnce, false, Bytes::from_static(b"ok"))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if broker.total_publish_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn publish_is_dropped_permanently_once_the_retry_bound_is_exceeded() {
    let broker = FakeBroker::new();
    let client = MqttClientBuilder::new()
        .max_publish_retry(1)
        .build_with_factory("device-a".to_owned(), broker.factory())
        .await
        .unwrap();
    let client_id = broker.client_ids().into_iter().next().unwrap();
    broker.set_fail_next_publishes(&client_id, 5);

    client
        .publish("status", QosLevel::AtLeastOnce, false, Bytes::from_static(b"ok"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.total_publish_count(), 0);
}

#[tokio::test]
async fn reconnecting_after_offline_resumes_publishing() {
    let (client, broker) = client_with_broker().await;
    let client_id = broker.client_ids().into_iter().next().unwrap();

    broker.interrupt(&client_id, "temporary");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!client.connected());

    client
        .publish("status", QosLevel::AtLeastOnce, false, Bytes::from_static(b"queued while offline"))
        .await
        .unwrap();

    broker.resume(&client_id, false);

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if broker.total_publish_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert!(client.connected());
}

#[tokio::test]
async fn close_is_idempotent_and_tears_down_the_client() {
    let (client, _broker) = client_with_broker().await;
    client.close().await;
    client.close().await;
}

fn cloud_configured() -> DeviceConfig {
    DeviceConfig { thing_name: "device-a".to_owned(), iot_data_endpoint: "endpoint".to_owned(), ..DeviceConfig::default() }
}

#[tokio::test]
async fn qualifying_reconfigure_applies_a_tighter_message_size_cap() {
    let (client, _broker) = client_with_broker().await;

    let (store, updater) = WatchConfigStore::new(cloud_configured());
    client.watch_config(store);

    updater.apply(
        DeviceConfig { max_message_size_in_bytes: 16, ..cloud_configured() },
        ConfigChange { kind: ChangeKind::NodeUpdated, node: Some("mqtt.maxMessageSizeInBytes".to_owned()) },
    );

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let result = client
        .publish("status", QosLevel::AtLeastOnce, false, Bytes::from(vec![0u8; 32]))
        .await;
    assert!(matches!(result, Err(Error::InvalidRequest(_))));
}

#[tokio::test]
async fn not_configured_for_cloud_rejects_publish_and_no_ops_subscribe() {
    let (client, broker) = client_with_broker().await;

    let (store, _updater) = WatchConfigStore::new(DeviceConfig::default());
    client.watch_config(store);

    let result = client.publish("status", QosLevel::AtLeastOnce, false, Bytes::from_static(b"x")).await;
    assert!(matches!(result, Err(Error::SpoolFull)));

    client.subscribe("x/1", QosLevel::AtLeastOnce).await.unwrap();
    let client_id = broker.client_ids().into_iter().next().unwrap();
    assert!(broker.subscriptions_for(&client_id).is_empty());
}
