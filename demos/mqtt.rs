use core::time::Duration;

use mqtt_spool_client::{MqttClientBuilder, QosLevel};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let thing_name_content = tokio::fs::read_to_string("thing-name.in").await?;
    let endpoint_content = tokio::fs::read_to_string("endpoint.in").await?;

    let ca_content = tokio::fs::read("AmazonRootCA1.pem").await?;
    let cert_content = tokio::fs::read("certificate.pem.crt").await?;
    let key_content = tokio::fs::read("private.pem.key").await?;

    let client = MqttClientBuilder::new()
        .thing_name(thing_name_content.trim())
        .endpoint(endpoint_content.trim())
        .ca(&ca_content)
        .certificate(&cert_content)
        .private_key(&key_content)
        .build()
        .await?;

    let mut message_sub = client.subscribe("message", QosLevel::AtLeastOnce).await?;
    let mut other_sub = client.subscribe("other", QosLevel::AtLeastOnce).await?;

    let _handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(msg) = message_sub.recv() => info!("message: {:?}", msg),
                Some(msg) = other_sub.recv() => info!("other: {:?}", msg),
            }
        }
    });

    loop {
        client
            .publish("message", QosLevel::AtLeastOnce, false, bytes::Bytes::from_static(b"Hello World"))
            .await?;

        tokio::time::sleep(Duration::from_secs(20)).await;
    }
}
