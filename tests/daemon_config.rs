use std::sync::Mutex;

use tempfile::NamedTempFile;

use streamwatch::StreamwatchConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "STREAMWATCH_CONFIG",
        "STREAMWATCH_MQTT_ADDR",
        "STREAMWATCH_DB_PATH",
        "STREAMWATCH_DEBOUNCE_MS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "streams": [
                {"id": "cam_front", "uri": "stub://front", "fps": 15, "weight": 2},
                {"id": "cam_rear", "uri": "stub://rear"}
            ],
            "scheduler": {"batch_size": 8, "workers": 4},
            "tracker": {"confirm_hits": 2, "miss_threshold": 10},
            "events": {"debounce_ms": 500},
            "zones": [
                {"id": "desk_1", "kind": "desk", "capacity": 2,
                 "points": [[0,0],[100,0],[100,100],[0,100]]}
            ],
            "gateway": {"subscriber_buffer": 32},
            "sink": {"db_path": "events.db"}
        }"#,
    );

    std::env::set_var("STREAMWATCH_CONFIG", file.path());
    std::env::set_var("STREAMWATCH_DB_PATH", "/tmp/override.db");
    std::env::set_var("STREAMWATCH_DEBOUNCE_MS", "750");

    let cfg = StreamwatchConfig::load().expect("load config");
    clear_env();

    assert_eq!(cfg.streams.len(), 2);
    assert_eq!(cfg.streams[0].id, "cam_front");
    assert_eq!(cfg.streams[0].fps, 15);
    assert_eq!(cfg.streams[0].weight, 2);
    // Unspecified fields get defaults.
    assert_eq!(cfg.streams[1].fps, 10);
    assert_eq!(cfg.scheduler.batch_size, 8);
    assert_eq!(cfg.scheduler.workers, 4);
    assert_eq!(cfg.tracker.confirm_hits, 2);
    assert_eq!(cfg.zones.len(), 1);
    assert_eq!(cfg.zones[0].capacity, 2);
    assert_eq!(cfg.gateway.subscriber_buffer, 32);
    // Env beats the file.
    assert_eq!(cfg.sink_db_path.as_deref(), Some("/tmp/override.db"));
    assert_eq!(cfg.events.debounce_ms, 750);
}

#[test]
fn mqtt_env_override_creates_gateway_settings() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{"streams": [{"id": "cam_a", "uri": "stub://a"}]}"#);
    std::env::set_var("STREAMWATCH_CONFIG", file.path());
    std::env::set_var("STREAMWATCH_MQTT_ADDR", "127.0.0.1:2883");

    let cfg = StreamwatchConfig::load().expect("load config");
    clear_env();

    let mqtt = cfg.gateway.mqtt.expect("mqtt settings from env");
    assert_eq!(mqtt.broker_addr, "127.0.0.1:2883");
    assert_eq!(mqtt.topic_prefix, "streamwatch");
    assert!(!mqtt.allow_remote);
}

#[test]
fn empty_stream_list_refuses_to_start() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{"streams": []}"#);
    let err = StreamwatchConfig::load_from(file.path()).unwrap_err();
    assert!(err.to_string().contains("stream list is empty"), "{}", err);
}

#[test]
fn malformed_zone_refuses_to_start() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "streams": [{"id": "cam_a", "uri": "stub://a"}],
            "zones": [{"id": "broken", "points": [[0,0],[10,10]]}]
        }"#,
    );
    assert!(StreamwatchConfig::load_from(file.path()).is_err());
}

#[test]
fn stream_ids_are_normalized_lowercase() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{"streams": [{"id": "Cam_A", "uri": "stub://a"}]}"#);
    let cfg = StreamwatchConfig::load_from(file.path()).expect("load config");
    assert_eq!(cfg.streams[0].id, "cam_a");
}
