use std::io::Write;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use zonewatch::config::DaemonConfig;
use zonewatch::BusinessType;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "ZONEWATCH_CONFIG",
        "ZONEWATCH_DB_PATH",
        "ZONEWATCH_SOURCE",
        "ZONEWATCH_BUSINESS",
        "ZONEWATCH_PROFILES_DIR",
        "ZONEWATCH_WINDOW_SECS",
        "ZONEWATCH_DETECTIONS",
    ] {
        std::env::remove_var(key);
    }
}

fn temp_file(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp file");
    file.write_all(contents.as_bytes()).expect("write temp file");
    file
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = DaemonConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "zonewatch.db");
    assert_eq!(cfg.detector.backend, "scripted");
    assert_eq!(cfg.sources.len(), 1);
    assert_eq!(cfg.sources[0].business_type, BusinessType::Retail);
    assert_eq!(cfg.sources[0].source, "stub://default");
    assert!(cfg.window_secs.is_none());
}

#[test]
fn loads_toml_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let detections = temp_file(".jsonl", "{\"seq\":1,\"detections\":[]}\n");
    let toml = format!(
        r#"
db_path = "store.db"
window_secs = 30

[detector]
detections = "{}"

[[sources]]
id = "counter"
business_type = "pharmacy"
source = "rtsp://10.0.0.5/stream"
target_fps = 5

[[sources]]
id = "gate"
business_type = "condominium"
source = "0"
"#,
        detections.path().display()
    );
    let file = temp_file(".toml", &toml);

    std::env::set_var("ZONEWATCH_CONFIG", file.path());
    std::env::set_var("ZONEWATCH_DB_PATH", "override.db");
    std::env::set_var("ZONEWATCH_WINDOW_SECS", "90");

    let cfg = DaemonConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "override.db");
    assert_eq!(cfg.window_secs, Some(90));
    assert_eq!(cfg.detector.backend, "replay");
    assert_eq!(cfg.sources.len(), 2);
    assert_eq!(cfg.sources[0].target_fps, 5);
    assert_eq!(cfg.sources[1].business_type, BusinessType::Residential);

    let profiles = cfg.profiles().expect("profiles");
    assert_eq!(profiles.get(BusinessType::Pharmacy).unwrap().window_secs, 90);
    let backends = cfg.backends().expect("backends");
    assert_eq!(backends.default_name(), Some("replay"));

    clear_env();
}

#[test]
fn env_source_replaces_configured_sources() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = temp_file(
        ".json",
        r#"{"sources": [{"id": "a", "business_type": "retail", "source": "stub://a"}]}"#,
    );
    std::env::set_var("ZONEWATCH_CONFIG", file.path());
    std::env::set_var("ZONEWATCH_SOURCE", "/data/lobby.mp4");
    std::env::set_var("ZONEWATCH_BUSINESS", "pharmacy");

    let cfg = DaemonConfig::load().expect("load config");
    assert_eq!(cfg.sources.len(), 1);
    assert_eq!(cfg.sources[0].source, "/data/lobby.mp4");
    assert_eq!(cfg.sources[0].business_type, BusinessType::Pharmacy);

    clear_env();
}

#[test]
fn rejects_invalid_configuration() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let shared_business = temp_file(
        ".json",
        r#"{"sources": [
            {"id": "a", "business_type": "retail", "source": "stub://a"},
            {"id": "b", "business_type": "supermarket", "source": "stub://b"}
        ]}"#,
    );
    std::env::set_var("ZONEWATCH_CONFIG", shared_business.path());
    assert!(DaemonConfig::load().is_err());

    clear_env();
    std::env::set_var("ZONEWATCH_WINDOW_SECS", "soon");
    assert!(DaemonConfig::load().is_err());

    clear_env();
    std::env::set_var("ZONEWATCH_BUSINESS", "bakery");
    assert!(DaemonConfig::load().is_err());

    clear_env();
    let replay_without_file = temp_file(".toml", "[detector]\nbackend = \"replay\"\n");
    std::env::set_var("ZONEWATCH_CONFIG", replay_without_file.path());
    assert!(DaemonConfig::load().is_err());

    clear_env();
}
