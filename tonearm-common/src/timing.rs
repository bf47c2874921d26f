//! Frame-based timing conversions
//!
//! The playback engine accounts for position in *frames* (one sample per
//! channel) at a known sample rate. Embedders talk in seconds or
//! milliseconds. These helpers are the only place the two units meet, so
//! conversions stay consistent across the pipeline.
//!
//! Frame counts are `u64`: at 192 kHz that covers roughly three million
//! years of audio, so overflow is not a practical concern.

use std::time::Duration;

/// Convert a frame count to seconds at the given sample rate.
///
/// Returns 0.0 when `sample_rate` is zero (an unprobed source).
pub fn frames_to_seconds(frames: u64, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    frames as f64 / sample_rate as f64
}

/// Convert seconds to a frame count at the given sample rate.
///
/// Negative inputs clamp to zero; fractional frames round to nearest.
pub fn seconds_to_frames(seconds: f64, sample_rate: u32) -> u64 {
    if seconds <= 0.0 || sample_rate == 0 {
        return 0;
    }
    (seconds * sample_rate as f64).round() as u64
}

/// Convert a frame count to whole milliseconds (truncating).
pub fn frames_to_ms(frames: u64, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    frames * 1000 / sample_rate as u64
}

/// Convert a frame count to a `Duration`.
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    Duration::from_secs_f64(frames_to_seconds(frames, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_to_seconds() {
        assert_eq!(frames_to_seconds(44100, 44100), 1.0);
        assert_eq!(frames_to_seconds(22050, 44100), 0.5);
        assert_eq!(frames_to_seconds(0, 44100), 0.0);
    }

    #[test]
    fn test_seconds_to_frames() {
        assert_eq!(seconds_to_frames(1.0, 44100), 44100);
        assert_eq!(seconds_to_frames(0.5, 48000), 24000);
        assert_eq!(seconds_to_frames(-1.0, 44100), 0);
    }

    #[test]
    fn test_roundtrip() {
        for rate in [8000u32, 22050, 44100, 48000, 96000] {
            let frames = seconds_to_frames(2.5, rate);
            let seconds = frames_to_seconds(frames, rate);
            assert!((seconds - 2.5).abs() < 1.0 / rate as f64);
        }
    }

    #[test]
    fn test_frames_to_ms_truncates() {
        // 1.999... seconds truncates to 1999 ms
        assert_eq!(frames_to_ms(88199, 44100), 1999);
        assert_eq!(frames_to_ms(88200, 44100), 2000);
    }

    #[test]
    fn test_zero_sample_rate() {
        assert_eq!(frames_to_seconds(1000, 0), 0.0);
        assert_eq!(seconds_to_frames(1.0, 0), 0);
        assert_eq!(frames_to_ms(1000, 0), 0);
    }

    #[test]
    fn test_frames_to_duration() {
        let d = frames_to_duration(44100, 44100);
        assert_eq!(d, Duration::from_secs(1));
    }
}
