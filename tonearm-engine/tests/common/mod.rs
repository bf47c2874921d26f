//! Shared helpers for the pipeline integration tests
//!
//! Fixtures are sine-wave WAV files generated with hound into a temp dir;
//! tracks play through an accelerated `QueueBackend` so wall-clock time
//! stays short while all media-time accounting (position, loops, drain)
//! behaves exactly as it would against real hardware.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tonearm_engine::{
    AudioSpec, AudioTrack, EngineConfig, QueueBackend, TrackEvent, TrackSource,
};

/// Sample rate used by every fixture (cheap to decode, no resampling when
/// the virtual device matches).
pub const FIXTURE_RATE: u32 = 8000;

/// Opt-in test logging: honors RUST_LOG, e.g.
/// `RUST_LOG=tonearm_engine=debug cargo test`.
pub fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Write a mono 440 Hz sine fixture of the given length.
pub fn write_sine_wav(dir: &TempDir, name: &str, seconds: f64) -> PathBuf {
    let path = dir.path().join(name);
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: FIXTURE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    let total = (seconds * FIXTURE_RATE as f64) as u32;
    for i in 0..total {
        let t = i as f32 / FIXTURE_RATE as f32;
        let sample = (t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 0.5;
        writer
            .write_sample((sample * i16::MAX as f32) as i16)
            .unwrap();
    }
    writer.finalize().unwrap();
    path
}

/// Track with an explicit virtual-device spec and config.
pub fn track_with(
    source: TrackSource,
    device: AudioSpec,
    multiplier: f64,
    config: EngineConfig,
) -> AudioTrack {
    AudioTrack::with_backend(
        source,
        config,
        Box::new(QueueBackend::with_multiplier(device, multiplier)),
    )
}

/// Track against an 8 kHz virtual device with default config.
pub fn track_for(path: &Path, multiplier: f64) -> AudioTrack {
    track_with(
        TrackSource::Path(path.to_path_buf()),
        AudioSpec::new(FIXTURE_RATE, 2),
        multiplier,
        EngineConfig::default(),
    )
}

/// Poll a predicate until it holds or the timeout passes.
pub fn wait_until(timeout: Duration, pred: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Drain events until one matches the predicate or the timeout passes.
pub fn wait_for_event(
    rx: &mut broadcast::Receiver<TrackEvent>,
    timeout: Duration,
    pred: impl Fn(&TrackEvent) -> bool,
) -> Option<TrackEvent> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match rx.try_recv() {
            Ok(event) => {
                if pred(&event) {
                    return Some(event);
                }
            }
            Err(broadcast::error::TryRecvError::Empty) => {
                std::thread::sleep(Duration::from_millis(2))
            }
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(broadcast::error::TryRecvError::Closed) => return None,
        }
    }
    None
}

/// Collect every event up to and including the first finished-playing.
pub fn collect_until_finished(
    rx: &mut broadcast::Receiver<TrackEvent>,
    timeout: Duration,
) -> Vec<TrackEvent> {
    let mut events = Vec::new();
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match rx.try_recv() {
            Ok(event) => {
                let done = matches!(event, TrackEvent::FinishedPlaying { .. });
                events.push(event);
                if done {
                    return events;
                }
            }
            Err(broadcast::error::TryRecvError::Empty) => {
                std::thread::sleep(Duration::from_millis(2))
            }
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(broadcast::error::TryRecvError::Closed) => break,
        }
    }
    events
}
