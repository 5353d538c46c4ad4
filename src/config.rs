use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::DeviceHint;
use crate::error::PipelineError;
use crate::geometry::{BBox, Polygon};
use crate::occupancy::{OccupancyMapper, ParkingSlot};
use crate::smoothing::DEFAULT_WINDOW;

const DEFAULT_MODEL_PATH: &str = "yolov8n.onnx";
const DEFAULT_CONFIDENCE: f32 = 0.4;
const DEFAULT_FRAME_INTERVAL_SECS: f64 = 2.0;
/// COCO car, motorcycle, bus, truck.
const DEFAULT_CLASSES: [u32; 4] = [2, 3, 5, 7];
const DEFAULT_TOTAL_SLOTS: usize = 16;
const DEFAULT_READ_RETRY_MS: u64 = 200;
const DEFAULT_UPDATE_MIN_SECS: f64 = 30.0;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
const DEFAULT_DETECT_TIMEOUT_SECS: f64 = 10.0;
const DEFAULT_STUB_SEED: u64 = 7;
const DEFAULT_WORKSHEET: &str = "Sheet1";
const DEFAULT_ROW_ID: &str = "5";
const DEFAULT_SINK_TIMEOUT_SECS: f64 = 10.0;

#[derive(Debug, Deserialize, Default)]
struct ParkingConfigFile {
    source: Option<String>,
    model_path: Option<PathBuf>,
    #[serde(alias = "conf")]
    confidence_threshold: Option<f32>,
    #[serde(alias = "frame_interval_sec")]
    frame_interval_seconds: Option<f64>,
    classes: Option<Vec<u32>>,
    parking_slots: Option<Vec<SlotFile>>,
    total_slots: Option<usize>,
    roi_path: Option<PathBuf>,
    sampling: Option<SamplingFile>,
    smoothing: Option<SmoothingFile>,
    update: Option<UpdateFile>,
    end_of_stream: Option<EndOfStreamFile>,
    detector: Option<DetectorFile>,
    sink: Option<SinkFile>,
    run_timeout_seconds: Option<f64>,
}

/// A slot is either `{id, x1, y1, x2, y2}`, `{id, bbox: [x1, y1, x2, y2]}`
/// or `{id, polygon: [[x, y], ...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SlotFile {
    Corners {
        id: u32,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
    },
    Bbox {
        id: u32,
        bbox: [f64; 4],
    },
    Polygon {
        id: u32,
        polygon: Vec<[f64; 2]>,
    },
}

#[derive(Debug, Deserialize, Default)]
struct SamplingFile {
    mode: Option<SamplingMode>,
    cycle_pause_seconds: Option<f64>,
    read_retry_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SmoothingFile {
    window: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct UpdateFile {
    min_interval_seconds: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct EndOfStreamFile {
    loop_video: Option<bool>,
    pause_seconds: Option<f64>,
    max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorFile {
    backend: Option<DetectorKind>,
    device: Option<String>,
    input_size: Option<u32>,
    iou_threshold: Option<f32>,
    timeout_seconds: Option<f64>,
    stub: Option<StubFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StubFile {
    vehicles: Option<Vec<[f32; 4]>>,
    miss_rate: Option<f64>,
    seed: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SinkFile {
    kind: Option<SinkKind>,
    sheet_key: Option<String>,
    token: Option<String>,
    worksheet: Option<String>,
    row_id: Option<String>,
    site_label: Option<String>,
    timeout_seconds: Option<f64>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    #[default]
    WallClock,
    FrameCount,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    #[default]
    Tract,
    Stub,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Memory,
    Sheets,
}

/// Resolved configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct ParkingConfig {
    pub source: String,
    pub model_path: PathBuf,
    pub confidence_threshold: f32,
    pub frame_interval: Duration,
    /// Empty means every class the detector reports.
    pub classes: Vec<u32>,
    pub parking_slots: Vec<ParkingSlot>,
    /// Used only when `parking_slots` is empty.
    pub total_slots: usize,
    pub roi_path: Option<PathBuf>,
    pub sampling: SamplingSettings,
    pub smoothing_window: usize,
    pub update_min_interval: Duration,
    pub end_of_stream: EndOfStreamSettings,
    pub detector: DetectorSettings,
    pub sink: SinkSettings,
    pub run_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct SamplingSettings {
    pub mode: SamplingMode,
    pub cycle_pause: Duration,
    pub read_retry: Duration,
}

#[derive(Debug, Clone)]
pub struct EndOfStreamSettings {
    pub loop_video: bool,
    pub pause: Duration,
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: DetectorKind,
    pub device: DeviceHint,
    pub input_size: u32,
    pub iou_threshold: f32,
    pub timeout: Duration,
    pub stub: StubSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StubSettings {
    pub vehicles: Vec<[f32; 4]>,
    pub miss_rate: f64,
    pub seed: u64,
}

#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub kind: SinkKind,
    pub sheet_key: Option<String>,
    pub token: Option<String>,
    pub worksheet: String,
    pub row_id: String,
    pub site_label: String,
    pub timeout: Duration,
}

impl ParkingConfig {
    /// Load from `path`, else `PARKING_CONFIG`, else defaults; then apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        Self::load_inner(path).map_err(|e| PipelineError::configuration(format!("{:#}", e)))
    }

    fn load_inner(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("PARKING_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let mut file_cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => read_config_file(&path)?,
            None => ParkingConfigFile::default(),
        };
        apply_env(&mut file_cfg)?;
        let cfg = Self::from_file(file_cfg)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a JSON document without touching the environment.
    pub fn from_json_str(raw: &str) -> Result<Self, PipelineError> {
        let parse = || -> Result<Self> {
            let file: ParkingConfigFile = serde_json::from_str(raw).context("invalid config")?;
            let cfg = Self::from_file(file)?;
            cfg.validate()?;
            Ok(cfg)
        };
        parse().map_err(|e| PipelineError::configuration(format!("{:#}", e)))
    }

    fn from_file(file: ParkingConfigFile) -> Result<Self> {
        let frame_interval = seconds(
            "frame_interval_seconds",
            file.frame_interval_seconds
                .unwrap_or(DEFAULT_FRAME_INTERVAL_SECS),
        )?;
        if frame_interval.is_zero() {
            return Err(anyhow!("frame_interval_seconds must be greater than zero"));
        }

        let parking_slots = file
            .parking_slots
            .unwrap_or_default()
            .into_iter()
            .map(SlotFile::into_slot)
            .collect::<Result<Vec<_>>>()?;

        let sampling_file = file.sampling.unwrap_or_default();
        let mode = sampling_file.mode.unwrap_or_default();
        let cycle_pause = match sampling_file.cycle_pause_seconds {
            Some(secs) => seconds("sampling.cycle_pause_seconds", secs)?,
            None if mode == SamplingMode::FrameCount => frame_interval,
            None => Duration::ZERO,
        };
        let sampling = SamplingSettings {
            mode,
            cycle_pause,
            read_retry: Duration::from_millis(
                sampling_file.read_retry_ms.unwrap_or(DEFAULT_READ_RETRY_MS),
            ),
        };

        let eos_file = file.end_of_stream.unwrap_or_default();
        let end_of_stream = EndOfStreamSettings {
            loop_video: eos_file.loop_video.unwrap_or(true),
            pause: match eos_file.pause_seconds {
                Some(secs) => seconds("end_of_stream.pause_seconds", secs)?,
                None => frame_interval,
            },
            max_reconnect_attempts: eos_file
                .max_reconnect_attempts
                .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS),
        };

        let detector_file = file.detector.unwrap_or_default();
        let stub_file = detector_file.stub.unwrap_or_default();
        let detector = DetectorSettings {
            backend: detector_file.backend.unwrap_or_default(),
            device: detector_file
                .device
                .as_deref()
                .unwrap_or("auto")
                .parse()
                .context("detector.device")?,
            input_size: detector_file.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            iou_threshold: detector_file
                .iou_threshold
                .unwrap_or(DEFAULT_IOU_THRESHOLD),
            timeout: seconds(
                "detector.timeout_seconds",
                detector_file
                    .timeout_seconds
                    .unwrap_or(DEFAULT_DETECT_TIMEOUT_SECS),
            )?,
            stub: StubSettings {
                vehicles: stub_file.vehicles.unwrap_or_default(),
                miss_rate: stub_file.miss_rate.unwrap_or(0.0),
                seed: stub_file.seed.unwrap_or(DEFAULT_STUB_SEED),
            },
        };

        let sink_file = file.sink.unwrap_or_default();
        let sheet_key = non_blank(sink_file.sheet_key);
        let sink = SinkSettings {
            kind: sink_file.kind.unwrap_or(if sheet_key.is_some() {
                SinkKind::Sheets
            } else {
                SinkKind::Memory
            }),
            sheet_key,
            token: non_blank(sink_file.token),
            worksheet: sink_file
                .worksheet
                .unwrap_or_else(|| DEFAULT_WORKSHEET.to_string()),
            row_id: sink_file
                .row_id
                .unwrap_or_else(|| DEFAULT_ROW_ID.to_string()),
            site_label: sink_file.site_label.unwrap_or_default(),
            timeout: seconds(
                "sink.timeout_seconds",
                sink_file
                    .timeout_seconds
                    .unwrap_or(DEFAULT_SINK_TIMEOUT_SECS),
            )?,
        };

        let run_timeout = file
            .run_timeout_seconds
            .map(|secs| seconds("run_timeout_seconds", secs))
            .transpose()?;

        Ok(Self {
            source: file.source.unwrap_or_default().trim().to_string(),
            model_path: file
                .model_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
            confidence_threshold: file.confidence_threshold.unwrap_or(DEFAULT_CONFIDENCE),
            frame_interval,
            classes: file.classes.unwrap_or_else(|| DEFAULT_CLASSES.to_vec()),
            parking_slots,
            total_slots: file.total_slots.unwrap_or(DEFAULT_TOTAL_SLOTS),
            roi_path: file.roi_path,
            sampling,
            smoothing_window: file
                .smoothing
                .and_then(|s| s.window)
                .unwrap_or(DEFAULT_WINDOW),
            update_min_interval: seconds(
                "update.min_interval_seconds",
                file.update
                    .and_then(|u| u.min_interval_seconds)
                    .unwrap_or(DEFAULT_UPDATE_MIN_SECS),
            )?,
            end_of_stream,
            detector,
            sink,
            run_timeout,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.source.is_empty() {
            return Err(anyhow!("source is required (config `source` or PARKING_SOURCE)"));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            ));
        }
        if self.parking_slots.is_empty() && self.total_slots == 0 {
            return Err(anyhow!(
                "total_slots must be greater than zero when no parking_slots are configured"
            ));
        }
        OccupancyMapper::new(self.parking_slots.clone())?;
        if self.smoothing_window == 0 {
            return Err(anyhow!("smoothing.window must be at least 1"));
        }
        if self.detector.input_size == 0 || self.detector.input_size % 32 != 0 {
            return Err(anyhow!(
                "detector.input_size must be a positive multiple of 32, got {}",
                self.detector.input_size
            ));
        }
        if !(self.detector.iou_threshold > 0.0 && self.detector.iou_threshold <= 1.0) {
            return Err(anyhow!("detector.iou_threshold must be within (0, 1]"));
        }
        if self.detector.timeout.is_zero() {
            return Err(anyhow!("detector.timeout_seconds must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.detector.stub.miss_rate) {
            return Err(anyhow!("detector.stub.miss_rate must be within [0, 1]"));
        }
        if self.sink.kind == SinkKind::Sheets {
            if self.sink.sheet_key.is_none() {
                return Err(anyhow!("sheets sink requires sink.sheet_key or PARKING_SHEET_KEY"));
            }
            if self.sink.token.is_none() {
                return Err(anyhow!("sheets sink requires sink.token or PARKING_SHEETS_TOKEN"));
            }
        }
        if self.sink.row_id.trim().is_empty() {
            return Err(anyhow!("sink.row_id must not be empty"));
        }
        Ok(())
    }

    /// Slot count used for free/occupied arithmetic.
    pub fn effective_total_slots(&self) -> usize {
        if self.parking_slots.is_empty() {
            self.total_slots
        } else {
            self.parking_slots.len()
        }
    }
}

impl SlotFile {
    fn into_slot(self) -> Result<ParkingSlot> {
        match self {
            Self::Corners { id, x1, y1, x2, y2 } | Self::Bbox { id, bbox: [x1, y1, x2, y2] } => {
                let bbox = BBox::new(x1, y1, x2, y2)
                    .with_context(|| format!("parking slot {}", id))?;
                Ok(ParkingSlot::with_box(id, bbox))
            }
            Self::Polygon { id, polygon } => {
                let polygon = Polygon::from_pairs(&polygon)
                    .with_context(|| format!("parking slot {}", id))?;
                Ok(ParkingSlot::with_polygon(id, polygon))
            }
        }
    }
}

fn apply_env(file: &mut ParkingConfigFile) -> Result<()> {
    if let Some(source) = env_value("PARKING_SOURCE") {
        file.source = Some(source);
    }
    if let Some(key) = env_value("PARKING_SHEET_KEY") {
        file.sink.get_or_insert_with(Default::default).sheet_key = Some(key);
    }
    if let Some(token) = env_value("PARKING_SHEETS_TOKEN") {
        file.sink.get_or_insert_with(Default::default).token = Some(token);
    }
    if let Some(row_id) = env_value("PARKING_ROW_ID") {
        file.sink.get_or_insert_with(Default::default).row_id = Some(row_id);
    }
    if let Some(total) = env_value("PARKING_TOTAL_SLOTS") {
        let total: usize = total
            .parse()
            .map_err(|_| anyhow!("PARKING_TOTAL_SLOTS must be a non-negative integer"))?;
        file.total_slots = Some(total);
    }
    if let Some(interval) = env_value("PARKING_SAMPLE_INTERVAL_SECS") {
        let interval: f64 = interval
            .parse()
            .map_err(|_| anyhow!("PARKING_SAMPLE_INTERVAL_SECS must be a number of seconds"))?;
        file.frame_interval_seconds = Some(interval);
    }
    if let Some(min) = env_value("PARKING_UPDATE_MIN_SECS") {
        let min: f64 = min
            .parse()
            .map_err(|_| anyhow!("PARKING_UPDATE_MIN_SECS must be a number of seconds"))?;
        file.update.get_or_insert_with(Default::default).min_interval_seconds = Some(min);
    }
    Ok(())
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| anyhow!("{} must be a finite, non-negative number of seconds", name))
}

fn read_config_file(path: &Path) -> Result<ParkingConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
