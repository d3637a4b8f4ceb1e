//! MQTT subscription delivering raw tracker records
//!
//! The tracker platform bridges its push channel onto the topic
//! `<channel>/<event>`. Each publish carries either `{ "data": [...] }`,
//! a bare array, or one record object; every record is forwarded to the
//! engine separately.

use crate::domain::types::InboundRecord;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Split one publish payload into individual records
pub fn split_payload(payload: &[u8]) -> Result<Vec<Value>, serde_json::Error> {
    let value: Value = serde_json::from_slice(payload)?;
    Ok(match value {
        Value::Array(records) => records,
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(records)) => records,
            Some(other) => vec![other],
            None => vec![Value::Object(map)],
        },
        other => vec![other],
    })
}

/// Start the MQTT client and forward records to the engine
///
/// Records are sent via try_send to avoid blocking the MQTT eventloop.
/// Dropped records are counted in metrics and logged (rate-limited).
pub async fn start_transport(
    config: &Config,
    record_tx: mpsc::Sender<InboundRecord>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut mqttoptions =
        MqttOptions::new(config.transport_client_id(), config.transport_host(), config.transport_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    if let (Some(username), Some(password)) =
        (config.transport_username(), config.transport_password())
    {
        mqttoptions.set_credentials(username, password);
    }

    let topic = config.transport_topic();
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client.subscribe(topic.as_str(), QoS::AtLeastOnce).await?;

    info!(
        topic = %topic,
        host = %config.transport_host(),
        port = %config.transport_port(),
        "transport_subscribed"
    );

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let received_at = Utc::now();
                        let records = match split_payload(&publish.payload) {
                            Ok(records) => records,
                            Err(e) => {
                                debug!(error = %e, topic = %publish.topic, "transport_payload_invalid");
                                continue;
                            }
                        };

                        debug!(topic = %publish.topic, records = records.len(), "transport_publish");
                        for payload in records {
                            match record_tx.try_send(InboundRecord { payload, received_at }) {
                                Ok(()) => {}
                                Err(TrySendError::Full(_)) => {
                                    metrics.record_transport_event_dropped();
                                    if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                        warn!("transport_record_dropped: channel full");
                                        last_drop_warn = Instant::now();
                                    }
                                }
                                Err(TrySendError::Closed(_)) => {
                                    warn!("transport_channel_closed");
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("transport_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "transport_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    unsubscribe(&client, &mut eventloop, &topic).await;
    info!("transport_shutdown");
    Ok(())
}

/// Unsubscribe and disconnect, polling the eventloop until the disconnect
/// goes out or a short deadline passes
async fn unsubscribe(client: &AsyncClient, eventloop: &mut rumqttc::EventLoop, topic: &str) {
    if let Err(e) = client.unsubscribe(topic).await {
        warn!(error = %e, "transport_unsubscribe_failed");
        return;
    }
    if let Err(e) = client.disconnect().await {
        warn!(error = %e, "transport_disconnect_failed");
        return;
    }

    let drain = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(2), drain).await.is_err() {
        debug!("transport_disconnect_timeout");
    }
}
