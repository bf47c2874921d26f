//! Level metering
//!
//! Peak and average (RMS) power per channel over the most recently
//! consumed playback buffer. Power is computed on the decode worker when a
//! spent buffer comes back from the device -- never in the render context
//! -- and lands in a `latest` slot. `update` publishes `latest` into the
//! snapshot the decibel getters read, so reads are cheap and stay stale
//! until the next `update` call, and nothing at all is computed while
//! metering is disabled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Reading floor for silent or unmetered channels, in dB.
const SILENCE_FLOOR_DB: f32 = -160.0;

/// Per-channel linear power figures for one buffer.
#[derive(Debug, Clone, Copy, Default)]
struct ChannelPower {
    peak: [f32; 2],
    average: [f32; 2],
}

/// Cached level meter for one track.
#[derive(Debug)]
pub struct MeterState {
    enabled: AtomicBool,
    latest: Mutex<ChannelPower>,
    snapshot: Mutex<ChannelPower>,
}

impl MeterState {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            latest: Mutex::new(ChannelPower::default()),
            snapshot: Mutex::new(ChannelPower::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Measure one consumed buffer of interleaved stereo samples.
    ///
    /// No effect while metering is disabled.
    pub(crate) fn ingest(&self, samples: &[f32]) {
        if !self.is_enabled() || samples.is_empty() {
            return;
        }

        let mut power = ChannelPower::default();
        let mut sum_sq = [0.0f64; 2];
        let frames = samples.len() / 2;

        for frame in samples.chunks_exact(2) {
            for (ch, &sample) in frame.iter().enumerate() {
                let magnitude = sample.abs();
                if magnitude > power.peak[ch] {
                    power.peak[ch] = magnitude;
                }
                sum_sq[ch] += (sample as f64) * (sample as f64);
            }
        }

        if frames > 0 {
            for ch in 0..2 {
                power.average[ch] = (sum_sq[ch] / frames as f64).sqrt() as f32;
            }
        }

        *self.latest.lock().unwrap() = power;
    }

    /// Publish the most recent measurement for the getters to read.
    pub fn update(&self) {
        let latest = *self.latest.lock().unwrap();
        *self.snapshot.lock().unwrap() = latest;
    }

    /// Peak power for a channel in decibels, from the published snapshot.
    pub fn peak_db(&self, channel: usize) -> f32 {
        let snapshot = self.snapshot.lock().unwrap();
        to_db(snapshot.peak.get(channel).copied().unwrap_or(0.0))
    }

    /// Average (RMS) power for a channel in decibels, from the published
    /// snapshot.
    pub fn average_db(&self, channel: usize) -> f32 {
        let snapshot = self.snapshot.lock().unwrap();
        to_db(snapshot.average.get(channel).copied().unwrap_or(0.0))
    }
}

fn to_db(linear: f32) -> f32 {
    if linear <= 0.0 {
        return SILENCE_FLOOR_DB;
    }
    (20.0 * linear.log10()).max(SILENCE_FLOOR_DB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_computes_nothing() {
        let meter = MeterState::new(false);
        meter.ingest(&[1.0, 1.0, 1.0, 1.0]);
        meter.update();
        assert_eq!(meter.peak_db(0), SILENCE_FLOOR_DB);
    }

    #[test]
    fn test_full_scale_is_zero_db() {
        let meter = MeterState::new(true);
        meter.ingest(&[1.0, -1.0, 1.0, -1.0]);
        meter.update();
        assert!(meter.peak_db(0).abs() < 1e-4);
        assert!(meter.peak_db(1).abs() < 1e-4);
        assert!(meter.average_db(0).abs() < 1e-4);
    }

    #[test]
    fn test_half_scale_peak() {
        let meter = MeterState::new(true);
        meter.ingest(&[0.5, 0.25, 0.5, 0.25]);
        meter.update();
        // 20*log10(0.5) = -6.02 dB
        assert!((meter.peak_db(0) + 6.02).abs() < 0.01);
        assert!((meter.peak_db(1) + 12.04).abs() < 0.01);
    }

    #[test]
    fn test_rms_of_sine() {
        let meter = MeterState::new(true);
        let mut samples = Vec::new();
        for i in 0..8000 {
            let s = (i as f32 / 100.0 * 2.0 * std::f32::consts::PI).sin();
            samples.push(s);
            samples.push(s);
        }
        meter.ingest(&samples);
        meter.update();
        // RMS of a full-scale sine is 1/sqrt(2) = -3.01 dB.
        assert!((meter.average_db(0) + 3.01).abs() < 0.1);
    }

    #[test]
    fn test_reads_stale_until_update() {
        let meter = MeterState::new(true);
        meter.ingest(&[1.0, 1.0]);
        meter.update();
        let before = meter.peak_db(0);

        // New data measured but not yet published.
        meter.ingest(&[0.1, 0.1]);
        assert_eq!(meter.peak_db(0), before);

        meter.update();
        assert!(meter.peak_db(0) < before);
    }

    #[test]
    fn test_out_of_range_channel_is_floor() {
        let meter = MeterState::new(true);
        meter.ingest(&[1.0, 1.0]);
        meter.update();
        assert_eq!(meter.peak_db(7), SILENCE_FLOOR_DB);
    }
}
