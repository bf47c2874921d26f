//! Playback position tracking
//!
//! Media position is reconstructed from the rendered-frame count the
//! render head maintains, anchored to a (base time, frame epoch) pair:
//!
//! `current_time = base_seconds + (frames_played - epoch_frames) / rate`
//!
//! Because `frames_played` only advances when samples actually leave for
//! the device, audio that is decoded but still sitting in enqueued buffers
//! is excluded automatically, and pausing the device freezes the clock
//! without explicit pause accounting. Discontinuities (seek promotion,
//! loop wrap) re-anchor the pair; between discontinuities the position is
//! monotonically non-decreasing while playing.

use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct Anchor {
    base_seconds: f64,
    epoch_frames: u64,
}

/// Seek-aware media clock for one session.
#[derive(Debug)]
pub struct PositionTracker {
    sample_rate: u32,
    anchor: Mutex<Anchor>,
}

impl PositionTracker {
    /// New tracker at media position zero.
    ///
    /// `sample_rate` is the device rate: rendered frames are counted after
    /// conversion.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            anchor: Mutex::new(Anchor {
                base_seconds: 0.0,
                epoch_frames: 0,
            }),
        }
    }

    /// Media position given the current rendered-frame count.
    pub fn current_time(&self, frames_played: u64) -> f64 {
        let anchor = *self.anchor.lock().unwrap();
        let advanced = frames_played.saturating_sub(anchor.epoch_frames);
        let time = anchor.base_seconds
            + tonearm_common::timing::frames_to_seconds(advanced, self.sample_rate);
        time.max(0.0)
    }

    /// Re-anchor the clock at `seconds`, effective immediately.
    ///
    /// Called at seek promotion (so the reported position snaps to the
    /// target the instant the shadow context becomes primary) and at the
    /// audible moment of a loop wrap.
    pub fn snap_to(&self, seconds: f64, frames_played: u64) {
        let mut anchor = self.anchor.lock().unwrap();
        anchor.base_seconds = seconds.max(0.0);
        anchor.epoch_frames = frames_played;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advances_with_frames() {
        let tracker = PositionTracker::new(44100);
        assert_eq!(tracker.current_time(0), 0.0);
        assert!((tracker.current_time(44100) - 1.0).abs() < 1e-9);
        assert!((tracker.current_time(66150) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_snap_forward_and_backward() {
        let tracker = PositionTracker::new(44100);

        // Played 2 s, then seek to 10 s.
        tracker.snap_to(10.0, 88200);
        assert!((tracker.current_time(88200) - 10.0).abs() < 1e-9);
        assert!((tracker.current_time(88200 + 44100) - 11.0).abs() < 1e-9);

        // Seek backward to 1 s.
        tracker.snap_to(1.0, 132300);
        assert!((tracker.current_time(132300) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_loop_wrap_resets_to_zero() {
        let tracker = PositionTracker::new(8000);
        tracker.snap_to(0.0, 80000); // wrap after 10 s
        assert_eq!(tracker.current_time(80000), 0.0);
        assert!((tracker.current_time(84000) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_never_negative() {
        let tracker = PositionTracker::new(44100);
        tracker.snap_to(5.0, 1000);
        // A frame count below the epoch (cannot normally happen) clamps.
        assert!(tracker.current_time(0) >= 0.0);
    }
}
