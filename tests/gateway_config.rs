use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use wildlife_gateway::{GatewayConfig, TransportKind};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "GATEWAY_CONFIG",
        "GATEWAY_DB_PATH",
        "GATEWAY_CLOUD_URL",
        "GATEWAY_CLOUD_TOKEN",
        "GATEWAY_NODE_ADDR",
        "GATEWAY_RADIO_DEVICE",
        "GATEWAY_MODEL_PATH",
        "GATEWAY_SYNC_INTERVAL_SECS",
    ] {
        std::env::remove_var(key);
    }
}

const CONFIG: &str = r#"
gateway_id = "gw-ridge-03"
db_path = "/var/lib/gateway/ridge.db"
telemetry_interval_secs = 120
sync_empty_results = true

[[cameras]]
name = "trail-north"
source = "rtsp://10.0.0.5:554/stream1"
transport = "network_stream"
target_fps = 5

[[cameras]]
name = "feeder"
source = "/dev/video0"
transport = "local_device"
width = 1280
height = 720
enabled = false

[detector]
labels = ["deer", "boar"]
confidence_threshold = 0.4

[bridge]
addr = "0.0.0.0:8090"
node_stale_secs = 900

[cloud]
url = "https://wildlife.example/api/v1"
api_token = "secret"

[sync]
interval_secs = 10
max_retries = 8
"#;

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, CONFIG.as_bytes()).expect("write config");

    std::env::set_var("GATEWAY_CONFIG", file.path());
    std::env::set_var("GATEWAY_CLOUD_URL", "https://backup.example/api/v1");
    std::env::set_var("GATEWAY_RADIO_DEVICE", "/dev/ttyUSB0");
    std::env::set_var("GATEWAY_SYNC_INTERVAL_SECS", "3");

    let cfg = GatewayConfig::load().expect("load config");

    assert_eq!(cfg.gateway_id.as_deref(), Some("gw-ridge-03"));
    assert_eq!(cfg.db_path, "/var/lib/gateway/ridge.db");
    assert_eq!(cfg.telemetry_interval, Duration::from_secs(120));
    assert!(cfg.sync_empty_results);

    assert_eq!(cfg.cameras.len(), 2);
    assert_eq!(cfg.cameras[0].name, "trail-north");
    assert_eq!(cfg.cameras[0].transport, TransportKind::NetworkStream);
    assert_eq!(cfg.cameras[0].target_fps, 5);
    assert!(cfg.cameras[0].enabled);
    assert_eq!(cfg.cameras[1].transport, TransportKind::LocalDevice);
    assert_eq!((cfg.cameras[1].width, cfg.cameras[1].height), (1280, 720));
    assert!(!cfg.cameras[1].enabled);

    assert_eq!(cfg.detector.settings.labels, vec!["deer", "boar"]);
    assert!((cfg.detector.settings.confidence_threshold - 0.4).abs() < f32::EPSILON);
    assert!(cfg.detector.model_path.is_none());

    assert_eq!(cfg.bridge.http_addr.as_deref(), Some("0.0.0.0:8090"));
    assert_eq!(cfg.bridge.radio_device, Some(PathBuf::from("/dev/ttyUSB0")));
    assert_eq!(cfg.node_stale_after, Duration::from_secs(900));

    assert_eq!(cfg.cloud.base_url, "https://backup.example/api/v1");
    assert_eq!(cfg.cloud.api_token.as_deref(), Some("secret"));
    assert_eq!(cfg.sync.sync_interval, Duration::from_secs(3));
    assert_eq!(cfg.sync.max_retries, 8);

    clear_env();
}

#[test]
fn node_api_can_be_disabled_from_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("GATEWAY_NODE_ADDR", "off");
    let cfg = GatewayConfig::load().expect("load config");
    assert!(cfg.bridge.http_addr.is_none());

    clear_env();
}

#[test]
fn rejects_bad_env_and_bad_files() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("GATEWAY_SYNC_INTERVAL_SECS", "soon");
    assert!(GatewayConfig::load().is_err());
    clear_env();

    std::env::set_var("GATEWAY_CLOUD_URL", "ftp://files.example");
    assert!(GatewayConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"[cloud]\nurl = \"http://x\"\nretries = 3\n")
        .expect("write config");
    std::env::set_var("GATEWAY_CONFIG", file.path());
    let err = GatewayConfig::load().expect_err("unknown key must be rejected");
    assert!(format!("{:#}", err).contains("retries"));

    clear_env();
}
