//! Playback pipeline: buffer pool, timing, metering, transport

pub mod buffer;
pub mod meter;
pub mod timing;
pub mod transport;

pub use meter::MeterState;
pub use timing::PositionTracker;
pub use transport::{AudioTrack, InterruptionEvent, TrackHandle, TransportState};
