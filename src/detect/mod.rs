mod adapter;
mod backend;
mod backends;
mod result;

pub use adapter::{AdapterConfig, DetectorAdapter, DEFAULT_DETECT_TIMEOUT};
pub use backend::{DetectRequest, DetectorBackend, DeviceHint, RawDetection};
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use result::{coco_class_name, Detection};
