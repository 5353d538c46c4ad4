use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use parking_occupancy::config::{DetectorKind, ParkingConfig, SamplingMode, SinkKind};
use parking_occupancy::PipelineError;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PARKING_CONFIG",
        "PARKING_SOURCE",
        "PARKING_SHEET_KEY",
        "PARKING_SHEETS_TOKEN",
        "PARKING_ROW_ID",
        "PARKING_TOTAL_SLOTS",
        "PARKING_SAMPLE_INTERVAL_SECS",
        "PARKING_UPDATE_MIN_SECS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_temp(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(&mut file, contents.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_temp(
        ".json",
        r#"{
            "source": "rtsp://camera-1/stream",
            "model_path": "models/yolov8s.onnx",
            "conf": 0.3,
            "frame_interval_sec": 5,
            "classes": [2],
            "parking_slots": [
                {"id": 10, "x1": 0, "y1": 0, "x2": 50, "y2": 50},
                {"id": 11, "polygon": [[60, 0], [110, 0], [110, 50], [60, 50]]}
            ],
            "detector": {"backend": "stub", "device": "cuda", "timeout_seconds": 3},
            "sink": {"worksheet": "Lots", "site_label": "Düsseldorf"}
        }"#,
    );

    std::env::set_var("PARKING_CONFIG", file.path());
    std::env::set_var("PARKING_SOURCE", "lot_recording.mp4");
    std::env::set_var("PARKING_ROW_ID", "12");
    std::env::set_var("PARKING_UPDATE_MIN_SECS", "90");
    std::env::set_var("PARKING_SHEET_KEY", "   ");

    let cfg = ParkingConfig::load(None).expect("load config");

    assert_eq!(cfg.source, "lot_recording.mp4");
    assert_eq!(cfg.model_path.to_str(), Some("models/yolov8s.onnx"));
    assert_eq!(cfg.confidence_threshold, 0.3);
    assert_eq!(cfg.frame_interval, Duration::from_secs(5));
    assert_eq!(cfg.classes, vec![2]);
    assert_eq!(cfg.effective_total_slots(), 2);
    assert_eq!(cfg.detector.backend, DetectorKind::Stub);
    assert_eq!(cfg.detector.timeout, Duration::from_secs(3));
    assert_eq!(cfg.update_min_interval, Duration::from_secs(90));
    assert_eq!(cfg.end_of_stream.pause, Duration::from_secs(5));
    // Blank env values are ignored, so no sheet key and the memory sink.
    assert_eq!(cfg.sink.kind, SinkKind::Memory);
    assert_eq!(cfg.sink.row_id, "12");
    assert_eq!(cfg.sink.worksheet, "Lots");
    assert_eq!(cfg.sink.site_label, "Düsseldorf");

    clear_env();
}

#[test]
fn explicit_path_wins_and_toml_is_supported() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_temp(
        ".toml",
        r#"
source = "stub://lot?frames=10"
total_slots = 24

[sampling]
mode = "frame_count"
read_retry_ms = 50

[smoothing]
window = 5

[end_of_stream]
loop_video = false
"#,
    );
    let decoy = write_temp(".json", "not json at all");
    std::env::set_var("PARKING_CONFIG", decoy.path());
    std::env::set_var("PARKING_SAMPLE_INTERVAL_SECS", "1.5");

    let cfg = ParkingConfig::load(Some(file.path())).expect("load toml config");

    assert_eq!(cfg.source, "stub://lot?frames=10");
    assert_eq!(cfg.effective_total_slots(), 24);
    assert_eq!(cfg.sampling.mode, SamplingMode::FrameCount);
    assert_eq!(cfg.sampling.read_retry, Duration::from_millis(50));
    assert_eq!(cfg.frame_interval, Duration::from_millis(1500));
    // Frame-count cadence pauses one interval per cycle by default.
    assert_eq!(cfg.sampling.cycle_pause, Duration::from_millis(1500));
    assert_eq!(cfg.smoothing_window, 5);
    assert!(!cfg.end_of_stream.loop_video);

    clear_env();
}

#[test]
fn environment_alone_is_enough() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PARKING_SOURCE", "stub://lot");
    std::env::set_var("PARKING_TOTAL_SLOTS", "40");
    std::env::set_var("PARKING_SHEET_KEY", "1AbCdEf");
    std::env::set_var("PARKING_SHEETS_TOKEN", "ya29.token");

    let cfg = ParkingConfig::load(None).expect("env-only config");
    assert_eq!(cfg.total_slots, 40);
    assert_eq!(cfg.sink.kind, SinkKind::Sheets);
    assert_eq!(cfg.sink.sheet_key.as_deref(), Some("1AbCdEf"));
    assert_eq!(cfg.sink.token.as_deref(), Some("ya29.token"));

    clear_env();
}

#[test]
fn bad_environment_values_are_configuration_errors() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PARKING_SOURCE", "stub://lot");
    for (key, value) in [
        ("PARKING_TOTAL_SLOTS", "sixteen"),
        ("PARKING_SAMPLE_INTERVAL_SECS", "soon"),
        ("PARKING_UPDATE_MIN_SECS", "-5"),
        ("PARKING_TOTAL_SLOTS", "0"),
    ] {
        std::env::set_var(key, value);
        let err = ParkingConfig::load(None).unwrap_err();
        assert!(
            matches!(err, PipelineError::Configuration(_)),
            "{}={} -> {:?}",
            key,
            value,
            err
        );
        assert!(err.is_run_fatal());
        std::env::remove_var(key);
    }

    clear_env();
}

#[test]
fn missing_source_and_unreadable_files_fail_fast() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let err = ParkingConfig::load(None).unwrap_err();
    assert!(err.to_string().contains("source is required"));

    let missing = std::env::temp_dir().join("parking-occupancy-no-such-config.json");
    let err = ParkingConfig::load(Some(&missing)).unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));

    clear_env();
}
