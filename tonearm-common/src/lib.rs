//! # Tonearm shared types (tonearm-common)
//!
//! Event definitions, the broadcast `EventBus`, and frame/time conversion
//! helpers shared between the playback engine and its embedders.

pub mod events;
pub mod timing;

pub use events::{EventBus, TrackEvent, TrackStatus};
