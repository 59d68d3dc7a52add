//! MQTT fan-out for event subscribers.
//!
//! Bridges a gateway subscription to an MQTT broker. Events go out QoS 0
//! to match the gateway's at-most-once contract; the availability topic
//! uses a retained Last Will so consumers can tell a clean shutdown from
//! a crash. The broker must be loopback unless `allow_remote` is set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::v5::LastWill, mqttbytes::QoS, Client, Connection, Event, MqttOptions};

use crate::config::MqttSettings;
use crate::gateway::{GatewayPayload, Subscription};
use crate::PipelineError;

const AVAILABILITY_SUFFIX: &str = "availability";
const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";
const RECV_TICK: Duration = Duration::from_millis(250);

pub struct MqttPublisher {
    client: Client,
    shutdown: Arc<AtomicBool>,
    publish_handle: Option<JoinHandle<()>>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttPublisher {
    /// Connect and start forwarding events from `subscription`.
    pub fn spawn(settings: &MqttSettings, subscription: Subscription) -> Result<Self> {
        let (host, port) = parse_broker_addr(&settings.broker_addr)?;
        if !settings.allow_remote {
            validate_loopback(&host, &settings.broker_addr)?;
        }

        let availability_topic = format!("{}/{}", settings.topic_prefix, AVAILABILITY_SUFFIX);
        let mut options = MqttOptions::new(&settings.client_id, &host, port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        options.set_last_will(LastWill::new(
            &availability_topic,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        ));
        let (client, connection) = Client::new(options, 10);

        let connection_handle = spawn_connection_loop(connection);
        client.publish(
            &availability_topic,
            QoS::AtLeastOnce,
            true,
            PAYLOAD_ONLINE.as_bytes().to_vec(),
        )?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let publish_handle = {
            let client = client.clone();
            let shutdown = shutdown.clone();
            let prefix = settings.topic_prefix.clone();
            std::thread::Builder::new()
                .name("mqtt-publish".to_string())
                .spawn(move || forward_loop(client, subscription, prefix, shutdown))
                .context("failed to spawn MQTT publish thread")?
        };

        log::info!("MQTT publisher connected to {}:{}", host, port);
        Ok(Self {
            client,
            shutdown,
            publish_handle: Some(publish_handle),
            connection_handle: Some(connection_handle),
        })
    }

    /// Publish offline availability and disconnect.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.publish_handle.take() {
            let _ = handle.join();
        }
        if let Err(e) = self.client.disconnect() {
            log::warn!("MQTT disconnect failed: {}", e);
        }
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_connection_loop(mut connection: Connection) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                Err(e) => {
                    log::warn!("MQTT connection error: {}", e);
                    break;
                }
            }
        }
    })
}

fn forward_loop(
    client: Client,
    subscription: Subscription,
    prefix: String,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Acquire) {
        let Some(message) = subscription.recv_timeout(RECV_TICK) else {
            continue;
        };
        let GatewayPayload::Event(event) = message.payload.as_ref() else {
            // Frame payloads stay in-process.
            continue;
        };
        let json = match serde_json::to_vec(event) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("failed to serialize event for MQTT: {}", e);
                continue;
            }
        };
        let topic = format!("{}/{}/events", prefix, event.stream_id);
        if let Err(e) = client.publish(&topic, QoS::AtMostOnce, false, json) {
            log::warn!(
                "{}",
                PipelineError::GatewayPublishFailure {
                    topic,
                    reason: e.to_string(),
                }
            );
        }
    }
}

fn parse_broker_addr(addr: &str) -> Result<(String, u16)> {
    let mut remainder = addr.trim();
    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    if let Some(rest) = remainder.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port.parse().context("invalid MQTT port")?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = remainder
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port.parse().context("invalid MQTT port")?;
    Ok((host.to_string(), port))
}

fn validate_loopback(host: &str, original: &str) -> Result<()> {
    if host == "localhost" {
        return Ok(());
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        if ip.is_loopback() {
            return Ok(());
        }
    }
    Err(anyhow!(
        "MQTT broker must be loopback: {} (set allow_remote to override)",
        original
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_broker_addr_forms() {
        assert_eq!(
            parse_broker_addr("mqtt://127.0.0.1:1883").unwrap(),
            ("127.0.0.1".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_addr("localhost:1883").unwrap(),
            ("localhost".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_addr("[::1]:1883").unwrap(),
            ("::1".to_string(), 1883)
        );
        assert!(parse_broker_addr("ws://host:1883").is_err());
        assert!(parse_broker_addr("127.0.0.1").is_err());
    }

    #[test]
    fn loopback_guard() {
        assert!(validate_loopback("127.0.0.1", "127.0.0.1:1883").is_ok());
        assert!(validate_loopback("::1", "[::1]:1883").is_ok());
        assert!(validate_loopback("localhost", "localhost:1883").is_ok());
        assert!(validate_loopback("192.168.1.5", "192.168.1.5:1883").is_err());
    }
}
