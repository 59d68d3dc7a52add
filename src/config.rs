//! Daemon configuration.
//!
//! Loaded from a JSON file named by `STREAMWATCH_CONFIG`, then overridden
//! by environment variables, then validated. Malformed zones or an empty
//! stream list are fatal: the process refuses to start.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;

use crate::event::ZoneSet;
use crate::{validate_identifier, PipelineError};

const DEFAULT_FPS: u32 = 10;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_STREAM_WEIGHT: u32 = 1;
const DEFAULT_BATCH_SIZE: usize = 4;
const DEFAULT_BATCH_WAIT_MS: u64 = 50;
const DEFAULT_QUEUE_DEPTH: usize = 8;
const DEFAULT_WORKERS: usize = 2;
const DEFAULT_CONFIRM_HITS: u32 = 3;
const DEFAULT_MISS_THRESHOLD: u32 = 30;
const DEFAULT_MATCH_COST_GATE: f32 = 0.7;
const DEFAULT_DEBOUNCE_MS: u64 = 2_000;
const DEFAULT_DWELL_MS: u64 = 30_000;
const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    streams: Option<Vec<StreamFile>>,
    scheduler: Option<SchedulerFile>,
    tracker: Option<TrackerFile>,
    events: Option<EventsFile>,
    zones: Option<Vec<ZoneFile>>,
    gateway: Option<GatewayFile>,
    sink: Option<SinkFile>,
}

#[derive(Debug, Deserialize)]
struct StreamFile {
    id: String,
    uri: String,
    fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    weight: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SchedulerFile {
    batch_size: Option<usize>,
    batch_wait_ms: Option<u64>,
    queue_depth: Option<usize>,
    workers: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerFile {
    confirm_hits: Option<u32>,
    miss_threshold: Option<u32>,
    match_cost_gate: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct EventsFile {
    debounce_ms: Option<u64>,
    dwell_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ZoneFile {
    id: String,
    kind: Option<String>,
    capacity: Option<usize>,
    points: Vec<[f32; 2]>,
}

#[derive(Debug, Deserialize, Default)]
struct GatewayFile {
    subscriber_buffer: Option<usize>,
    mqtt: Option<MqttFile>,
}

#[derive(Debug, Deserialize)]
struct MqttFile {
    broker_addr: String,
    topic_prefix: Option<String>,
    client_id: Option<String>,
    allow_remote: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct SinkFile {
    db_path: String,
}

#[derive(Debug, Clone)]
pub struct StreamwatchConfig {
    pub streams: Vec<StreamSettings>,
    pub scheduler: SchedulerSettings,
    pub tracker: TrackerSettings,
    pub events: EventSettings,
    pub zones: Vec<ZoneSettings>,
    pub gateway: GatewaySettings,
    pub sink_db_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub id: String,
    pub uri: String,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Fair-scheduling weight. Higher weight streams get proportionally
    /// more batch slots under contention.
    pub weight: u32,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub batch_size: usize,
    pub batch_wait_ms: u64,
    pub queue_depth: usize,
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub confirm_hits: u32,
    pub miss_threshold: u32,
    pub match_cost_gate: f32,
}

#[derive(Debug, Clone)]
pub struct EventSettings {
    pub debounce_ms: u64,
    pub dwell_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ZoneSettings {
    pub id: String,
    pub kind: String,
    pub capacity: usize,
    pub points: Vec<[f32; 2]>,
}

#[derive(Debug, Clone, Default)]
pub struct GatewaySettings {
    pub subscriber_buffer: usize,
    pub mqtt: Option<MqttSettings>,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker_addr: String,
    pub topic_prefix: String,
    pub client_id: String,
    pub allow_remote: bool,
}

impl StreamwatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("STREAMWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => read_config_file(Path::new(path))?,
            None => ConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from an explicit path, bypassing `STREAMWATCH_CONFIG`.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConfigFile) -> Self {
        let streams = file
            .streams
            .unwrap_or_default()
            .into_iter()
            .map(|s| StreamSettings {
                id: s.id,
                uri: s.uri,
                fps: s.fps.unwrap_or(DEFAULT_FPS),
                width: s.width.unwrap_or(DEFAULT_WIDTH),
                height: s.height.unwrap_or(DEFAULT_HEIGHT),
                weight: s.weight.unwrap_or(DEFAULT_STREAM_WEIGHT),
            })
            .collect();
        let sched = file.scheduler.unwrap_or_default();
        let tracker = file.tracker.unwrap_or_default();
        let events = file.events.unwrap_or_default();
        let gateway = file.gateway.unwrap_or_default();
        Self {
            streams,
            scheduler: SchedulerSettings {
                batch_size: sched.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
                batch_wait_ms: sched.batch_wait_ms.unwrap_or(DEFAULT_BATCH_WAIT_MS),
                queue_depth: sched.queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH),
                workers: sched.workers.unwrap_or(DEFAULT_WORKERS),
            },
            tracker: TrackerSettings {
                confirm_hits: tracker.confirm_hits.unwrap_or(DEFAULT_CONFIRM_HITS),
                miss_threshold: tracker.miss_threshold.unwrap_or(DEFAULT_MISS_THRESHOLD),
                match_cost_gate: tracker.match_cost_gate.unwrap_or(DEFAULT_MATCH_COST_GATE),
            },
            events: EventSettings {
                debounce_ms: events.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS),
                dwell_ms: events.dwell_ms.unwrap_or(DEFAULT_DWELL_MS),
            },
            zones: file
                .zones
                .unwrap_or_default()
                .into_iter()
                .map(|z| ZoneSettings {
                    id: z.id,
                    kind: z.kind.unwrap_or_else(|| "generic".to_string()),
                    capacity: z.capacity.unwrap_or(usize::MAX),
                    points: z.points,
                })
                .collect(),
            gateway: GatewaySettings {
                subscriber_buffer: gateway
                    .subscriber_buffer
                    .unwrap_or(DEFAULT_SUBSCRIBER_BUFFER),
                mqtt: gateway.mqtt.map(|m| MqttSettings {
                    broker_addr: m.broker_addr,
                    topic_prefix: m.topic_prefix.unwrap_or_else(|| "streamwatch".to_string()),
                    client_id: m.client_id.unwrap_or_else(|| "streamwatchd".to_string()),
                    allow_remote: m.allow_remote.unwrap_or(false),
                }),
            },
            sink_db_path: file.sink.map(|s| s.db_path),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("STREAMWATCH_MQTT_ADDR") {
            if !addr.trim().is_empty() {
                match self.gateway.mqtt.as_mut() {
                    Some(mqtt) => mqtt.broker_addr = addr,
                    None => {
                        self.gateway.mqtt = Some(MqttSettings {
                            broker_addr: addr,
                            topic_prefix: "streamwatch".to_string(),
                            client_id: "streamwatchd".to_string(),
                            allow_remote: false,
                        })
                    }
                }
            }
        }
        if let Ok(path) = std::env::var("STREAMWATCH_DB_PATH") {
            if !path.trim().is_empty() {
                self.sink_db_path = Some(path);
            }
        }
        if let Ok(debounce) = std::env::var("STREAMWATCH_DEBOUNCE_MS") {
            let ms: u64 = debounce.parse().map_err(|_| {
                anyhow!("STREAMWATCH_DEBOUNCE_MS must be an integer number of milliseconds")
            })?;
            self.events.debounce_ms = ms;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.streams.is_empty() {
            return Err(PipelineError::InvalidConfig("stream list is empty".into()).into());
        }
        let mut seen = std::collections::HashSet::new();
        for stream in &mut self.streams {
            validate_identifier(&stream.id)
                .map_err(|e| PipelineError::InvalidConfig(format!("stream id: {}", e)))?;
            stream.id = stream.id.to_lowercase();
            if !seen.insert(stream.id.clone()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "duplicate stream id '{}'",
                    stream.id
                ))
                .into());
            }
            if stream.fps == 0 || stream.width == 0 || stream.height == 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "stream '{}' has zero fps or dimensions",
                    stream.id
                ))
                .into());
            }
            if stream.weight == 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "stream '{}' weight must be >= 1",
                    stream.id
                ))
                .into());
            }
        }

        if self.scheduler.batch_size == 0
            || self.scheduler.queue_depth == 0
            || self.scheduler.workers == 0
        {
            return Err(PipelineError::InvalidConfig(
                "scheduler batch_size, queue_depth, and workers must be >= 1".into(),
            )
            .into());
        }
        if self.tracker.confirm_hits == 0 || self.tracker.miss_threshold == 0 {
            return Err(PipelineError::InvalidConfig(
                "tracker confirm_hits and miss_threshold must be >= 1".into(),
            )
            .into());
        }
        if !(self.tracker.match_cost_gate > 0.0) {
            return Err(PipelineError::InvalidConfig(
                "tracker match_cost_gate must be positive".into(),
            )
            .into());
        }
        if self.events.debounce_ms == 0 || self.events.dwell_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "event debounce_ms and dwell_ms must be >= 1".into(),
            )
            .into());
        }
        if self.gateway.subscriber_buffer == 0 {
            return Err(PipelineError::InvalidConfig(
                "gateway subscriber_buffer must be >= 1".into(),
            )
            .into());
        }

        // Zone geometry is validated by constructing the set.
        ZoneSet::from_settings(&self.zones)
            .map_err(|e| PipelineError::InvalidConfig(format!("zones: {}", e)))?;
        for zone in &mut self.zones {
            zone.id = zone.id.to_lowercase();
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_file(streams: &str, zones: &str) -> ConfigFile {
        let json = format!(r#"{{ "streams": {}, "zones": {} }}"#, streams, zones);
        serde_json::from_str(&json).expect("parse test config")
    }

    #[test]
    fn empty_stream_list_is_fatal() {
        let mut cfg = StreamwatchConfig::from_file(minimal_file("[]", "[]"));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_stream_ids_are_fatal() {
        let streams = r#"[
            {"id": "cam_a", "uri": "stub://a"},
            {"id": "cam_a", "uri": "stub://b"}
        ]"#;
        let mut cfg = StreamwatchConfig::from_file(minimal_file(streams, "[]"));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn malformed_zone_polygon_is_fatal() {
        let streams = r#"[{"id": "cam_a", "uri": "stub://a"}]"#;
        let zones = r#"[{"id": "desk_1", "points": [[0,0],[10,0]]}]"#;
        let mut cfg = StreamwatchConfig::from_file(minimal_file(streams, zones));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn defaults_fill_unspecified_sections() {
        let streams = r#"[{"id": "cam_a", "uri": "stub://a"}]"#;
        let mut cfg = StreamwatchConfig::from_file(minimal_file(streams, "[]"));
        cfg.validate().expect("valid config");
        assert_eq!(cfg.scheduler.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(cfg.tracker.confirm_hits, DEFAULT_CONFIRM_HITS);
        assert_eq!(cfg.events.debounce_ms, DEFAULT_DEBOUNCE_MS);
        assert_eq!(cfg.streams[0].fps, DEFAULT_FPS);
    }
}
