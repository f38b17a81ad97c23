//! MQTT telemetry publisher (§6, supplemented per `mqtt.py`).
//!
//! Both two-tone matches and single new-tone detections publish under
//! the same `new_tone_detected` event type, distinguished only by the
//! shape of `tone_details` — that is exactly what `publish_new_tone_pair`
//! and `publish_new_tone_detection` do in `mqtt.py`, so the distinction
//! is preserved here rather than split into two event types.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::tone::ToneEvent;

#[derive(Serialize)]
struct TonePayload<'a> {
    event_type: &'static str,
    device_id: &'a str,
    tone_details: ToneDetails,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ToneDetails {
    TwoTone { tone_a: f64, tone_b: f64 },
    NewTone { frequency_hz: f64, duration_ms: u64, range_hz: f64 },
}

fn tone_details(event: &ToneEvent) -> ToneDetails {
    match event {
        ToneEvent::TwoTone { tone_a_hz, tone_b_hz, .. } => ToneDetails::TwoTone {
            tone_a: *tone_a_hz,
            tone_b: *tone_b_hz,
        },
        ToneEvent::NewTone { frequency_hz, duration_ms, range_hz } => ToneDetails::NewTone {
            frequency_hz: *frequency_hz,
            duration_ms: *duration_ms,
            range_hz: *range_hz,
        },
    }
}

#[async_trait]
pub trait TelemetryPublisher: Send + Sync {
    async fn publish_tone_event(&self, event: &ToneEvent);
}

pub struct NullTelemetryPublisher;

#[async_trait]
impl TelemetryPublisher for NullTelemetryPublisher {
    async fn publish_tone_event(&self, event: &ToneEvent) {
        debug!(?event, "telemetry disabled, dropping tone event");
    }
}

pub struct MqttTelemetryPublisher {
    device_id: String,
    client: rumqttc::AsyncClient,
}

impl MqttTelemetryPublisher {
    /// Connects to `host:port` and spawns the event-loop polling task,
    /// following `gouthamsk98-VAD-Sensor-Bridge`'s `AsyncClient` +
    /// `EventLoop` pattern.
    pub fn connect(device_id: String, host: &str, port: u16) -> Self {
        let mut mqtt_options = rumqttc::MqttOptions::new(format!("echostream-{device_id}"), host, port);
        mqtt_options.set_keep_alive(std::time::Duration::from_secs(30));

        let (client, mut event_loop) = rumqttc::AsyncClient::new(mqtt_options, 16);
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(notification) => debug!(?notification, "mqtt event"),
                    Err(e) => {
                        warn!(error = %e, "mqtt connection error, retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { device_id, client }
    }
}

#[async_trait]
impl TelemetryPublisher for MqttTelemetryPublisher {
    async fn publish_tone_event(&self, event: &ToneEvent) {
        let payload = TonePayload {
            event_type: "new_tone_detected",
            device_id: &self.device_id,
            tone_details: tone_details(event),
        };
        let topic = format!("from/device/{}/tone_detection", self.device_id);
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "failed to serialize tone telemetry payload");
                return;
            }
        };
        if let Err(e) = self.client.publish(topic, rumqttc::QoS::AtLeastOnce, false, body).await {
            error!(error = %e, "failed to publish tone telemetry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_tone_and_new_tone_share_event_type() {
        let two_tone = ToneEvent::TwoTone {
            tone_id: "x".into(),
            tone_a_hz: 800.0,
            tone_b_hz: 1000.0,
            record_length_ms: 5_000,
        };
        let new_tone = ToneEvent::NewTone {
            frequency_hz: 950.0,
            duration_ms: 2000,
            range_hz: 10.0,
        };
        let payload_a = TonePayload {
            event_type: "new_tone_detected",
            device_id: "dev",
            tone_details: tone_details(&two_tone),
        };
        let payload_b = TonePayload {
            event_type: "new_tone_detected",
            device_id: "dev",
            tone_details: tone_details(&new_tone),
        };
        assert_eq!(payload_a.event_type, payload_b.event_type);
    }
}
