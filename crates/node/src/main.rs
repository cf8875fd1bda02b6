mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sim::{PowerSim, Scenario};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "broker.hivemq.com".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let topic = env::var("TOPIC").unwrap_or_else(|_| "digikey/power/telemetry".to_string());
    let scenario = Scenario::from_str_lossy(&env::var("SCENARIO").unwrap_or_default());
    let sample_every = Duration::from_millis(env_or("SAMPLE_EVERY_MS", 1000));

    let client_id = format!("power-node-{}", fastrand::u32(..));
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // Publish only, but the eventloop still has to run to keep the
    // connection alive and flush outgoing packets.
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("connected to mqtt"),
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let mut sim = PowerSim::new(scenario);
    info!(%topic, scenario = %sim.scenario(), every_ms = sample_every.as_millis() as u64, "publishing");

    loop {
        let sample = sim.next_sample();
        let payload = serde_json::to_vec(&sample)?;

        if let Err(e) = client
            .publish(&topic, QoS::AtMostOnce, false, payload)
            .await
        {
            warn!("publish error: {e}");
        } else {
            info!(
                status = %sample.status,
                voltage = sample.voltage,
                current = sample.current,
                power = sample.power,
                "published"
            );
        }

        sleep(sample_every).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_on_missing_key() {
        assert_eq!(env_or("POWER_NODE_TEST_UNSET_KEY", 1883_u16), 1883);
    }

    #[test]
    fn payload_is_device_json() {
        let mut sim = PowerSim::new(Scenario::Spike);
        let payload = serde_json::to_vec(&sim.next_sample()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["status"], "OK");
        assert_eq!(json["voltage"], 230.0);
    }
}
