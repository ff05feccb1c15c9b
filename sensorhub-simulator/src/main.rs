use rand::Rng;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, sleep};
use tracing_subscriber::EnvFilter;

/// Raw reading as a field sensor publishes it on its own topic.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
struct Reading {
    temperature: f64,
    humidity: f64,
    co2: f64,
}

/// Actuator states the kernel publishes on `{topic}-control`.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ControlStates {
    fans_state: bool,
    lights_state: bool,
    hvac_state: bool,
}

struct SimConfig {
    host: String,
    port: u16,
    topics: Vec<String>,
    interval: Duration,
}

impl SimConfig {
    fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        Self {
            host: var("SENSORHUB_MQTT_HOST").unwrap_or_else(|| "localhost".into()),
            port: var("SENSORHUB_MQTT_PORT").and_then(|p| p.parse().ok()).unwrap_or(1883),
            topics: parse_topics(var("SENSORHUB_SIM_TOPICS").as_deref()),
            interval: Duration::from_millis(
                var("SENSORHUB_SIM_INTERVAL_MS").and_then(|v| v.parse().ok()).unwrap_or(1000),
            ),
        }
    }
}

fn parse_topics(raw: Option<&str>) -> Vec<String> {
    let topics: Vec<String> = raw
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect();
    if topics.is_empty() {
        (1..=4).map(|i| format!("temp{i}")).collect()
    } else {
        topics
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn random_reading<R: Rng>(rng: &mut R) -> Reading {
    Reading {
        temperature: round2(rng.gen_range(20.0..30.0)),
        humidity: round2(rng.gen_range(30.0..70.0)),
        co2: round2(rng.gen_range(400.0..800.0)),
    }
}

fn control_topic(topic: &str) -> String {
    format!("{topic}-control")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = SimConfig::from_env();
    let mut opts = MqttOptions::new("sensorhub-simulator", cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(opts, 10);

    // Receive loop: (re)subscribe to control topics on every ConnAck, log what the kernel sends.
    let subscriber = client.clone();
    let control_topics: Vec<String> = cfg.topics.iter().map(|t| control_topic(t)).collect();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    tracing::info!("connected to MQTT broker");
                    for topic in &control_topics {
                        if let Err(e) = subscriber.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                            tracing::warn!(%topic, error = %e, "subscribe failed");
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    match serde_json::from_slice::<ControlStates>(&p.payload) {
                        Ok(states) => tracing::info!(
                            topic = %p.topic,
                            fans = states.fans_state,
                            lights = states.lights_state,
                            hvac = states.hvac_state,
                            "control command"
                        ),
                        Err(e) => tracing::warn!(topic = %p.topic, error = %e, "unreadable control command"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = ?e, "MQTT connection error, retrying");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    tracing::info!(topics = ?cfg.topics, host = %cfg.host, port = cfg.port, "simulating devices");
    loop {
        for topic in &cfg.topics {
            let reading = random_reading(&mut rand::thread_rng());
            let payload = serde_json::to_vec(&reading)?;
            match client.publish(topic.as_str(), QoS::AtLeastOnce, false, payload).await {
                Ok(()) => tracing::debug!(%topic, ?reading, "reading sent"),
                Err(e) => tracing::warn!(%topic, error = %e, "publish failed"),
            }
            sleep(cfg.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn readings_stay_in_sensor_ranges() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let r = random_reading(&mut rng);
            assert!((20.0..=30.0).contains(&r.temperature));
            assert!((30.0..=70.0).contains(&r.humidity));
            assert!((400.0..=800.0).contains(&r.co2));
            assert_eq!(round2(r.co2), r.co2);
        }
    }

    #[test]
    fn topics_default_to_four_devices() {
        assert_eq!(parse_topics(None), vec!["temp1", "temp2", "temp3", "temp4"]);
        assert_eq!(parse_topics(Some(" room1/sensors , ,lab ")), vec!["room1/sensors", "lab"]);
        assert_eq!(control_topic("lab"), "lab-control");
    }

    #[test]
    fn control_payload_matches_kernel_layout() {
        let states: ControlStates =
            serde_json::from_str(r#"{"fansState":true,"lightsState":false,"hvacState":true}"#).unwrap();
        assert!(states.fans_state && states.hvac_state && !states.lights_state);
    }
}
