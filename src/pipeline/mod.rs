//! Behavioural event pipeline: detection, sampling and batched delivery.

pub mod batcher;
pub mod detector;
pub mod sampling;

pub use batcher::{BatcherSettings, ClientDestination, EventBatcher};
pub use detector::{
    AddedNode, Detection, DomEvent, DomEventKind, ElementInfo, EventDetector, FormInfo, VideoInfo,
};
pub use sampling::{REPLAY_CAPACITY, SamplingDecision, SamplingEngine};
