//! Playback buffer pool and real-time render head
//!
//! A fixed set of buffers circulates between the decode worker and the
//! output backend through two lock-free SPSC rings: `filled` carries
//! decoded audio toward the device, `spent` returns consumed buffers for
//! refill. Ownership moves with the buffer itself, so neither side ever
//! shares a writable buffer with the other.
//!
//! `RenderHead` is the only code that runs in the real-time context. It
//! pops, copies, applies gain and pan from atomics, counts rendered frames
//! and underruns, and pushes spent buffers back. It never locks, blocks,
//! or allocates.

use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// The render path is always interleaved stereo; backends adapt wider or
/// narrower devices in their own callback.
pub(crate) const DEVICE_CHANNELS: usize = 2;

/// One fixed-capacity block of converted device-layout PCM.
///
/// A buffer is either *free* (worker-owned, refillable) or *enqueued*
/// (owned by the output backend) -- never both. The generation tag marks
/// which decode epoch filled it; the render head discards buffers from a
/// superseded epoch.
#[derive(Debug)]
pub struct PlaybackBuffer {
    samples: Vec<f32>,
    frames: usize,
    capacity_frames: usize,
    generation: u64,
    played: bool,
}

impl PlaybackBuffer {
    pub(crate) fn new(capacity_frames: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity_frames * DEVICE_CHANNELS),
            frames: 0,
            capacity_frames,
            generation: 0,
            played: false,
        }
    }

    /// Reset for refilling under the given decode generation.
    ///
    /// Keeps the allocation; only the bookkeeping changes.
    pub(crate) fn begin_fill(&mut self, generation: u64) {
        self.samples.clear();
        self.frames = 0;
        self.generation = generation;
        self.played = false;
    }

    /// Whether the render head actually played this buffer (stale buffers
    /// come back unplayed).
    pub(crate) fn was_played(&self) -> bool {
        self.played
    }

    /// Append interleaved stereo samples, up to capacity.
    ///
    /// Returns the number of frames actually taken.
    pub(crate) fn push_frames(&mut self, interleaved: &[f32]) -> usize {
        let offered = interleaved.len() / DEVICE_CHANNELS;
        let take = offered.min(self.capacity_frames - self.frames);
        self.samples
            .extend_from_slice(&interleaved[..take * DEVICE_CHANNELS]);
        self.frames += take;
        take
    }

    pub(crate) fn frames(&self) -> usize {
        self.frames
    }

    pub(crate) fn is_full(&self) -> bool {
        self.frames >= self.capacity_frames
    }

    pub(crate) fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

/// Per-session counters shared between the render head, the decode worker,
/// and the transport. All access is atomic; the render side never waits.
#[derive(Debug, Default)]
pub(crate) struct SessionShared {
    /// Frames actually copied out to the device
    pub frames_played: AtomicU64,
    /// Frames handed to the device side (decremented when a stale buffer
    /// is discarded unplayed)
    pub frames_decoded: AtomicU64,
    /// Starved render passes
    pub underruns: AtomicU64,
    /// Current decode epoch; bumped on seek promotion and teardown
    pub generation: AtomicU64,
    /// Mirror of the transport Playing state for lock-free reads
    pub playing: AtomicBool,
}

/// Volume and pan, persistent across sessions.
///
/// Stored as f32 bit patterns so the render callback can read them without
/// a lock.
#[derive(Debug)]
pub(crate) struct ControlShared {
    volume_bits: AtomicU32,
    pan_bits: AtomicU32,
}

impl ControlShared {
    pub(crate) fn new() -> Self {
        Self {
            volume_bits: AtomicU32::new(1.0f32.to_bits()),
            pan_bits: AtomicU32::new(0.0f32.to_bits()),
        }
    }

    pub(crate) fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn set_volume(&self, volume: f32) {
        self.volume_bits
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn pan(&self) -> f32 {
        f32::from_bits(self.pan_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn set_pan(&self, pan: f32) {
        self.pan_bits
            .store(pan.clamp(-1.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}

/// Left/right gains for a pan position in [-1.0, 1.0].
fn pan_gains(pan: f32) -> (f32, f32) {
    let pan = pan.clamp(-1.0, 1.0);
    ((1.0 - pan).min(1.0), (1.0 + pan).min(1.0))
}

/// Consumer end of the buffer pool, owned by the output backend.
///
/// The only type that touches audio data in the real-time context.
pub struct RenderHead {
    filled: ringbuf::HeapCons<PlaybackBuffer>,
    spent: ringbuf::HeapProd<PlaybackBuffer>,
    current: Option<PlaybackBuffer>,
    cursor: usize,
    session: Arc<SessionShared>,
    control: Arc<ControlShared>,
}

impl RenderHead {
    /// Fill `out` (interleaved stereo) from enqueued buffers.
    ///
    /// Applies volume and pan, advances the rendered-frame count, and
    /// silences the remainder on starvation (counted once per starved
    /// pass). Real-time safe.
    pub fn render(&mut self, out: &mut [f32]) {
        let volume = self.control.volume();
        let (left_gain, right_gain) = pan_gains(self.control.pan());

        let total = out.len() - out.len() % DEVICE_CHANNELS;
        let mut idx = 0;
        let mut copied_frames = 0u64;

        while idx < total {
            if self.current.is_none() && !self.advance() {
                break;
            }

            let buf = self.current.as_ref().expect("current buffer present");
            let available = buf.frames() - self.cursor;
            if available == 0 {
                self.retire();
                continue;
            }

            let buf_frames = buf.frames();
            let want = (total - idx) / DEVICE_CHANNELS;
            let take = want.min(available);
            let src =
                &buf.samples()[self.cursor * DEVICE_CHANNELS..(self.cursor + take) * DEVICE_CHANNELS];
            for frame in src.chunks_exact(DEVICE_CHANNELS) {
                out[idx] = (frame[0] * volume * left_gain).clamp(-1.0, 1.0);
                out[idx + 1] = (frame[1] * volume * right_gain).clamp(-1.0, 1.0);
                idx += DEVICE_CHANNELS;
            }

            self.cursor += take;
            copied_frames += take as u64;

            if self.cursor >= buf_frames {
                self.retire();
            }
        }

        if copied_frames > 0 {
            self.session
                .frames_played
                .fetch_add(copied_frames, Ordering::Relaxed);
        }

        if idx < total {
            out[idx..].fill(0.0);
            self.session.underruns.fetch_add(1, Ordering::Relaxed);
        } else if total < out.len() {
            out[total..].fill(0.0);
        }
    }

    /// Pop the next live buffer, recycling any stale-generation buffers.
    fn advance(&mut self) -> bool {
        let generation = self.session.generation.load(Ordering::Acquire);
        loop {
            match self.filled.try_pop() {
                Some(buf) => {
                    if buf.generation() != generation {
                        // Superseded by a seek; unwind its decode account
                        // and hand it straight back for refill.
                        self.session
                            .frames_decoded
                            .fetch_sub(buf.frames() as u64, Ordering::Relaxed);
                        let _ = self.spent.try_push(buf);
                        continue;
                    }
                    self.cursor = 0;
                    self.current = Some(buf);
                    return true;
                }
                None => return false,
            }
        }
    }

    fn retire(&mut self) {
        if let Some(mut buf) = self.current.take() {
            buf.played = true;
            // The ring is sized to the pool, so this always fits.
            let _ = self.spent.try_push(buf);
            self.cursor = 0;
        }
    }
}

/// Worker-side wiring produced by `build_pool`.
pub(crate) struct PoolWiring {
    /// Producer of filled buffers (decode worker)
    pub filled_tx: ringbuf::HeapProd<PlaybackBuffer>,
    /// Consumer of spent buffers (decode worker)
    pub spent_rx: ringbuf::HeapCons<PlaybackBuffer>,
    /// Buffers not yet in flight
    pub free: Vec<PlaybackBuffer>,
    /// Device-side end, handed to the output backend
    pub head: RenderHead,
}

/// Allocate the session's buffer pool and hand-off rings.
///
/// All allocation for the real-time path happens here, once, at prepare
/// time.
pub(crate) fn build_pool(
    buffer_count: usize,
    buffer_frames: usize,
    session: Arc<SessionShared>,
    control: Arc<ControlShared>,
) -> PoolWiring {
    let filled = HeapRb::<PlaybackBuffer>::new(buffer_count);
    let spent = HeapRb::<PlaybackBuffer>::new(buffer_count);
    let (filled_tx, filled_rx) = filled.split();
    let (spent_tx, spent_rx) = spent.split();

    let free = (0..buffer_count)
        .map(|_| PlaybackBuffer::new(buffer_frames))
        .collect();

    PoolWiring {
        filled_tx,
        spent_rx,
        free,
        head: RenderHead {
            filled: filled_rx,
            spent: spent_tx,
            current: None,
            cursor: 0,
            session,
            control,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(count: usize, frames: usize) -> (PoolWiring, Arc<SessionShared>, Arc<ControlShared>) {
        let session = Arc::new(SessionShared::default());
        let control = Arc::new(ControlShared::new());
        let wiring = build_pool(count, frames, Arc::clone(&session), Arc::clone(&control));
        (wiring, session, control)
    }

    fn filled_buffer(mut buf: PlaybackBuffer, generation: u64, value: f32) -> PlaybackBuffer {
        buf.begin_fill(generation);
        let frames = buf.capacity_frames;
        buf.push_frames(&vec![value; frames * DEVICE_CHANNELS]);
        buf
    }

    #[test]
    fn test_buffer_push_respects_capacity() {
        let mut buf = PlaybackBuffer::new(4);
        buf.begin_fill(1);
        assert_eq!(buf.push_frames(&[0.1; 6]), 3);
        assert_eq!(buf.push_frames(&[0.2; 6]), 1);
        assert!(buf.is_full());
        assert_eq!(buf.generation(), 1);
    }

    #[test]
    fn test_render_copies_and_counts() {
        let (mut wiring, session, _control) = pool(2, 8);
        let buf = filled_buffer(wiring.free.pop().unwrap(), 0, 0.5);
        let frames = buf.frames() as u64;
        session.frames_decoded.fetch_add(frames, Ordering::Relaxed);
        wiring.filled_tx.try_push(buf).ok().unwrap();

        let mut out = vec![0.0f32; 8 * DEVICE_CHANNELS];
        wiring.head.render(&mut out);

        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
        assert_eq!(session.frames_played.load(Ordering::Relaxed), 8);
        assert_eq!(session.underruns.load(Ordering::Relaxed), 0);

        // The consumed buffer came back on the spent ring.
        assert!(wiring.spent_rx.try_pop().is_some());
    }

    #[test]
    fn test_render_starved_is_silent_and_counted() {
        let (mut wiring, session, _control) = pool(2, 8);
        let mut out = vec![1.0f32; 16];
        wiring.head.render(&mut out);

        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(session.underruns.load(Ordering::Relaxed), 1);
        assert_eq!(session.frames_played.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_render_applies_volume_and_pan() {
        let (mut wiring, _session, control) = pool(2, 4);
        control.set_volume(0.5);
        control.set_pan(-1.0); // hard left: right channel muted
        let buf = filled_buffer(wiring.free.pop().unwrap(), 0, 0.8);
        wiring.filled_tx.try_push(buf).ok().unwrap();

        let mut out = vec![0.0f32; 4 * DEVICE_CHANNELS];
        wiring.head.render(&mut out);

        for frame in out.chunks_exact(2) {
            assert!((frame[0] - 0.4).abs() < 1e-6);
            assert_eq!(frame[1], 0.0);
        }
    }

    #[test]
    fn test_stale_generation_skipped() {
        let (mut wiring, session, _control) = pool(2, 4);

        let stale = filled_buffer(wiring.free.pop().unwrap(), 0, 0.9);
        session
            .frames_decoded
            .fetch_add(stale.frames() as u64, Ordering::Relaxed);
        wiring.filled_tx.try_push(stale).ok().unwrap();

        // Promote a new generation, then enqueue a live buffer.
        session.generation.store(1, Ordering::Release);
        let live = filled_buffer(wiring.free.pop().unwrap(), 1, 0.25);
        session
            .frames_decoded
            .fetch_add(live.frames() as u64, Ordering::Relaxed);
        wiring.filled_tx.try_push(live).ok().unwrap();

        let mut out = vec![0.0f32; 4 * DEVICE_CHANNELS];
        wiring.head.render(&mut out);

        // The stale buffer was skipped, not played.
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
        // Its decode accounting was unwound: 4 live frames remain counted.
        assert_eq!(session.frames_decoded.load(Ordering::Relaxed), 4);
        // Skipped buffer is immediately available for refill.
        assert!(wiring.spent_rx.try_pop().is_some());
    }

    #[test]
    fn test_partial_buffer_then_starved() {
        let (mut wiring, session, _control) = pool(2, 8);
        let mut buf = wiring.free.pop().unwrap();
        buf.begin_fill(0);
        buf.push_frames(&[0.3; 3 * DEVICE_CHANNELS]);
        wiring.filled_tx.try_push(buf).ok().unwrap();

        let mut out = vec![1.0f32; 8 * DEVICE_CHANNELS];
        wiring.head.render(&mut out);

        assert_eq!(session.frames_played.load(Ordering::Relaxed), 3);
        assert_eq!(session.underruns.load(Ordering::Relaxed), 1);
        // Remainder is silence.
        assert!(out[3 * DEVICE_CHANNELS..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_control_clamps() {
        let control = ControlShared::new();
        control.set_volume(2.0);
        assert_eq!(control.volume(), 1.0);
        control.set_pan(-3.0);
        assert_eq!(control.pan(), -1.0);
    }
}
