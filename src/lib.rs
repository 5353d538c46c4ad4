//! Parking occupancy estimation from camera feeds.
//!
//! # Architecture
//!
//! One sequential pipeline per camera:
//!
//! ```text
//! FrameSource -> DetectorAdapter (ROI mask + detect + filter)
//!             -> OccupancyMapper (or raw vehicle count)
//!             -> MedianSmoother -> UpdateGate -> RecordSink
//! ```
//!
//! The object detector and the record store are external collaborators
//! behind the `DetectorBackend` and `RecordSink` traits. Everything else is
//! plain data flowing through owned components; there is no global state, so
//! several pipelines can run side by side.
//!
//! # Module Structure
//!
//! - `geometry`: point-in-box and point-in-polygon tests
//! - `roi`: region-of-interest files and frame masks
//! - `frame`, `ingest`: decoded frames and the sources producing them
//! - `detect`: detector boundary, adapter and backends
//! - `occupancy`, `smoothing`, `gate`: the estimation core
//! - `sink`: record store boundary
//! - `schedule`, `pipeline`: clock, cancellation and the driver loop
//! - `config`, `error`: startup configuration and failure taxonomy

pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod gate;
pub mod geometry;
pub mod ingest;
pub mod occupancy;
pub mod pipeline;
pub mod roi;
pub mod schedule;
pub mod sink;
pub mod smoothing;

pub use config::{DetectorKind, ParkingConfig, SamplingMode, SinkKind};
pub use detect::{
    AdapterConfig, DetectRequest, Detection, DetectorAdapter, DetectorBackend, DeviceHint,
    RawDetection, StubBackend,
};
pub use error::PipelineError;
pub use frame::{Frame, FrameRead};
pub use gate::{GateDecision, GateOutcome, ReportedState, UpdateGate};
pub use geometry::{point_in_box, point_in_polygon, BBox, Point, Polygon};
pub use ingest::{open_source, FrameSource, SourceStats, SyntheticSource};
pub use occupancy::{OccupancyMapper, OccupancySnapshot, ParkingSlot, SlotRegion};
pub use pipeline::{
    Cadence, CycleOutcome, DriverState, Pipeline, PipelineSettings, RunStats, RunSummary,
    StopReason,
};
pub use roi::{RegionMask, RegionOfInterest};
pub use schedule::{Clock, ManualClock, StopSignal, SystemClock};
pub use sink::{publish_occupancy, MemorySink, PublishAction, RecordSink, SheetLayout};
pub use smoothing::{MedianSmoother, SmoothedEstimate};
