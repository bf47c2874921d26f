//! # Tonearm playback engine (tonearm-engine)
//!
//! Streaming audio track playback: decode compressed media to PCM, convert
//! to the output device's native layout, and feed a small pool of playback
//! buffers to a real-time output callback, with transport control
//! (play/pause/stop/seek/loop), interruption recovery, position tracking,
//! and level metering.
//!
//! **Architecture:** symphonia decode -> rubato conversion -> lock-free
//! buffer hand-off -> cpal output (or a virtual paced device), orchestrated
//! by a per-track decode worker thread. The real-time side only copies
//! samples and moves buffer ownership; it never locks, allocates, or
//! decodes.
//!
//! ```no_run
//! use tonearm_engine::{AudioTrack, EngineConfig, TrackSource};
//!
//! let track = AudioTrack::new(
//!     TrackSource::Path("music.flac".into()),
//!     EngineConfig::default(),
//! );
//! let events = track.subscribe();
//! if track.prepare_to_play() {
//!     track.set_number_of_loops(1);
//!     track.play();
//! }
//! # drop(events);
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod playback;
pub mod registry;

pub use audio::{AudioSpec, CpalBackend, OutputBackend, QueueBackend, TrackSource};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use playback::{AudioTrack, InterruptionEvent, TrackHandle, TransportState};
pub use registry::TrackRegistry;
pub use tonearm_common::events::{EventBus, TrackEvent, TrackStatus};
