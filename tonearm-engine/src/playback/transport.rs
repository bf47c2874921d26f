//! Transport state machine and decode worker
//!
//! `AudioTrack` owns one prepared media source and drives the whole
//! pipeline: prepare opens the primary decode context, allocates the
//! buffer pool, prefills it, and hands the render head to the output
//! backend; play/pause/stop gate the device; seeks build a shadow decode
//! context on their own thread and promote it at a clean boundary; loop
//! wraps and end-of-stream are detected on the decode worker and announced
//! on the event bus.
//!
//! The decode worker is a single plain thread per session (commands arrive
//! through a mutex-and-condvar inbox, with a short poll tick for ring
//! traffic). It is the only producer of filled buffers and the only
//! consumer of spent ones, so the primary decode cursor is never raced.

use crate::audio::convert::FormatConverter;
use crate::audio::output::{CpalBackend, OutputBackend};
use crate::audio::reader::{ReadOutcome, SourceDecodeReader};
use crate::audio::types::{AudioSpec, TrackSource};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::playback::buffer::{
    build_pool, ControlShared, PlaybackBuffer, SessionShared, DEVICE_CHANNELS,
};
use crate::playback::meter::MeterState;
use crate::playback::timing::PositionTracker;
use ringbuf::traits::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::broadcast;
use tonearm_common::events::{EventBus, TrackEvent, TrackStatus};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Frames requested from the decode reader per pull
const DECODE_CHUNK_FRAMES: usize = 2048;

/// Transport lifecycle of one track.
///
/// `Failed` is terminal; `Ended` keeps the session queryable until an
/// explicit `stop`. `Stopped` is equivalent to `Unprepared` for reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Unprepared,
    Preparing,
    ReadyToPlay,
    Playing,
    Paused,
    Stopped,
    Ended,
    Failed,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportState::Unprepared => "unprepared",
            TransportState::Preparing => "preparing",
            TransportState::ReadyToPlay => "ready",
            TransportState::Playing => "playing",
            TransportState::Paused => "paused",
            TransportState::Stopped => "stopped",
            TransportState::Ended => "ended",
            TransportState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Session/device interruption signal, injected by the embedder (or a
/// registry) instead of arriving through any process-wide notification
/// bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionEvent {
    /// The system reclaimed the output device; a playing track pauses.
    Began,
    /// The device is available again.
    Ended {
        /// System hint that playback should resume
        should_resume: bool,
    },
}

// ========================================
// Worker plumbing
// ========================================

enum WorkerMsg {
    /// Build a shadow context at `target` (fanned out to a seek thread)
    Seek { target: f64, seq: u64 },
    /// A shadow context finished building
    Promote {
        reader: Result<SourceDecodeReader>,
        target: f64,
        seq: u64,
    },
}

struct WorkerState {
    inbox: Mutex<VecDeque<WorkerMsg>>,
    condvar: Condvar,
    stop: AtomicBool,
    /// Latest seek sequence number; completions from older seeks are
    /// discarded
    seek_seq: AtomicU64,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            inbox: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            stop: AtomicBool::new(false),
            seek_seq: AtomicU64::new(0),
        }
    }

    fn post(&self, msg: WorkerMsg) {
        self.inbox.lock().unwrap().push_back(msg);
        self.condvar.notify_one();
    }
}

/// Everything the decode worker owns for one session.
struct DecodeSession {
    source: TrackSource,
    reader: SourceDecodeReader,
    converter: FormatConverter,
    /// Converted device-layout samples awaiting buffer space
    stash: Vec<f32>,
    free: Vec<PlaybackBuffer>,
    filled_tx: ringbuf::HeapProd<PlaybackBuffer>,
    spent_rx: ringbuf::HeapCons<PlaybackBuffer>,
    shared: Arc<SessionShared>,
    tracker: Arc<PositionTracker>,
    loops_remaining: Arc<AtomicI32>,
    /// (device frame at which the wrap becomes audible, loops left after)
    pending_wraps: VecDeque<(u64, i32)>,
    /// End of stream reached with no loops left; no further refills
    draining: bool,
    /// Converter tail already flushed for the current stream end
    flushed: bool,
    /// A transient reopen has been spent since the last clean fill
    retried: bool,
}

enum FillOutcome {
    /// Buffer holds data and more remains
    Data,
    /// Stream is over; buffer may hold a final partial fill
    End,
}

impl DecodeSession {
    /// Reclaim spent buffers, then fill and enqueue as many free buffers
    /// as possible. Returns true when at least one buffer was enqueued.
    fn refill(&mut self, meter: &MeterState) -> Result<bool> {
        while let Some(buf) = self.spent_rx.try_pop() {
            if buf.was_played() && buf.frames() > 0 {
                meter.ingest(buf.samples());
            }
            self.free.push(buf);
        }

        if self.draining {
            return Ok(false);
        }

        let mut pushed = false;
        while let Some(mut buf) = self.free.pop() {
            match self.fill_buffer(&mut buf) {
                Ok(outcome) => {
                    let frames = buf.frames() as u64;
                    let end = matches!(outcome, FillOutcome::End);

                    if frames > 0 {
                        self.shared.frames_decoded.fetch_add(frames, Ordering::Relaxed);
                        if let Err(buf) = self.filled_tx.try_push(buf) {
                            // Cannot happen with a pool-sized ring; recover
                            // rather than lose the buffer if it ever does.
                            self.shared.frames_decoded.fetch_sub(frames, Ordering::Relaxed);
                            self.free.push(buf);
                            warn!("Filled ring unexpectedly full");
                            break;
                        }
                        pushed = true;
                        self.retried = false;
                    } else {
                        self.free.push(buf);
                    }

                    if end {
                        self.draining = true;
                        debug!("Decode drained; awaiting final buffers to play out");
                        break;
                    }
                }
                Err(e) => {
                    self.free.push(buf);
                    return Err(e);
                }
            }
        }
        Ok(pushed)
    }

    /// Fill one buffer from the stash/reader/converter chain, wrapping the
    /// decode cursor back to zero while loops remain.
    fn fill_buffer(&mut self, buf: &mut PlaybackBuffer) -> Result<FillOutcome> {
        buf.begin_fill(self.shared.generation.load(Ordering::Acquire));

        loop {
            if buf.is_full() {
                return Ok(FillOutcome::Data);
            }

            if !self.stash.is_empty() {
                let taken = buf.push_frames(&self.stash);
                self.stash.drain(..taken * DEVICE_CHANNELS);
                continue;
            }

            match self.reader.read_chunk(DECODE_CHUNK_FRAMES)? {
                ReadOutcome::Decoded(chunk) => {
                    self.stash = self.converter.convert(&chunk)?;
                }
                ReadOutcome::EndOfStream => {
                    if !self.flushed {
                        self.flushed = true;
                        let tail = self.converter.flush()?;
                        if !tail.is_empty() {
                            self.stash = tail;
                            continue;
                        }
                    }

                    let loops = self.loops_remaining.load(Ordering::Relaxed);
                    if loops != 0 {
                        if loops > 0 {
                            self.loops_remaining.fetch_sub(1, Ordering::Relaxed);
                        }
                        // Rebuild the context at zero and keep filling this
                        // same buffer: the wrap is gapless.
                        self.reader = SourceDecodeReader::open(&self.source)?;
                        self.converter.reset(self.reader.spec())?;
                        self.flushed = false;

                        let wrap_frame = self.shared.frames_decoded.load(Ordering::Relaxed)
                            + buf.frames() as u64;
                        let loops_left = self.loops_remaining.load(Ordering::Relaxed);
                        self.pending_wraps.push_back((wrap_frame, loops_left));
                        debug!("Loop wrap queued at device frame {}", wrap_frame);
                        continue;
                    }

                    return Ok(FillOutcome::End);
                }
            }
        }
    }

    /// Swap a completed shadow context in as the new primary.
    ///
    /// Bumps the generation so buffers filled before the seek are skipped
    /// by the render head, and snaps the position clock to the target the
    /// instant the promotion happens.
    fn promote(&mut self, reader: SourceDecodeReader, target: f64) -> Result<()> {
        self.converter.reset(reader.spec())?;
        self.reader = reader;
        self.stash.clear();
        self.pending_wraps.clear();
        self.draining = false;
        self.flushed = false;
        self.retried = false;

        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        self.tracker
            .snap_to(target, self.shared.frames_played.load(Ordering::Relaxed));
        Ok(())
    }
}

// ========================================
// Shared track state
// ========================================

/// Per-session fields visible from the transport lock.
struct SessionHandle {
    id: Uuid,
    shared: Arc<SessionShared>,
    source_spec: AudioSpec,
    /// Media duration in seconds (0.0 when the container does not declare
    /// one)
    duration: f64,
    tracker: Arc<PositionTracker>,
    worker_state: Arc<WorkerState>,
    worker_thread: Option<JoinHandle<()>>,
}

struct TransportLock {
    transport: TransportState,
    status: TrackStatus,
    error: Option<Arc<Error>>,
    backend: Box<dyn OutputBackend>,
    session: Option<SessionHandle>,
    interrupted: bool,
    position_before_interruption: Option<f64>,
    /// Session armed by `play_at_time`, awaiting its deadline
    scheduled_start: Option<Uuid>,
}

struct TrackInner {
    id: Uuid,
    source: TrackSource,
    config: EngineConfig,
    events: EventBus,
    control: Arc<ControlShared>,
    meter: MeterState,
    number_of_loops: AtomicI32,
    loops_remaining: Arc<AtomicI32>,
    state: Mutex<TransportLock>,
}

/// One playable media source with transport control.
///
/// Cloning yields another handle to the same track; all handles observe
/// and drive the same state.
#[derive(Clone)]
pub struct AudioTrack {
    inner: Arc<TrackInner>,
}

/// Weak reference to a track, held by registries.
#[derive(Clone)]
pub struct TrackHandle(Weak<TrackInner>);

impl TrackHandle {
    /// Recover a usable track handle, if the track is still alive.
    pub fn upgrade(&self) -> Option<AudioTrack> {
        self.0.upgrade().map(|inner| AudioTrack { inner })
    }
}

impl AudioTrack {
    /// Create a track playing through the default cpal device backend.
    pub fn new(source: TrackSource, config: EngineConfig) -> Self {
        let backend = Box::new(CpalBackend::new(config.device.clone()));
        Self::with_backend(source, config, backend)
    }

    /// Create a track with an explicit output backend.
    pub fn with_backend(
        source: TrackSource,
        config: EngineConfig,
        backend: Box<dyn OutputBackend>,
    ) -> Self {
        let metering = config.metering;
        let event_capacity = config.event_capacity;
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4(),
                source,
                config,
                events: EventBus::new(event_capacity),
                control: Arc::new(ControlShared::new()),
                meter: MeterState::new(metering),
                number_of_loops: AtomicI32::new(0),
                loops_remaining: Arc::new(AtomicI32::new(0)),
                state: Mutex::new(TransportLock {
                    transport: TransportState::Unprepared,
                    status: TrackStatus::Unknown,
                    error: None,
                    backend,
                    session: None,
                    interrupted: false,
                    position_before_interruption: None,
                    scheduled_start: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source.clone()
    }

    /// Subscribe to this track's events.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackEvent> {
        self.inner.events.subscribe()
    }

    /// Weak handle for registries.
    pub fn handle(&self) -> TrackHandle {
        TrackHandle(Arc::downgrade(&self.inner))
    }

    // ----------------------------------------
    // Transport commands
    // ----------------------------------------

    /// Open the source, allocate and prefill the buffer pool, and hand the
    /// render head to the output device.
    ///
    /// Returns true on success. On failure the track is `Failed`, `error`
    /// is populated, and a fatal decode-error event is emitted.
    pub fn prepare_to_play(&self) -> bool {
        match self.prepare() {
            Ok(()) => true,
            Err(e) => {
                warn!("Track {} failed to prepare: {}", self.inner.id, e);
                let message = e.to_string();
                {
                    let mut st = self.inner.state.lock().unwrap();
                    st.transport = TransportState::Failed;
                    st.status = TrackStatus::Failed;
                    st.error = Some(Arc::new(e));
                }
                self.inner.events.emit(TrackEvent::DecodeError {
                    track_id: self.inner.id,
                    message,
                    fatal: true,
                    timestamp: chrono::Utc::now(),
                });
                false
            }
        }
    }

    fn prepare(&self) -> Result<()> {
        let inner = &self.inner;
        let mut st = inner.state.lock().unwrap();
        match st.transport {
            TransportState::Unprepared | TransportState::Stopped => {}
            TransportState::ReadyToPlay
            | TransportState::Playing
            | TransportState::Paused
            | TransportState::Preparing => return Ok(()),
            TransportState::Ended => {
                return Err(Error::InvalidState(
                    "stop the ended session before preparing again".to_string(),
                ))
            }
            TransportState::Failed => {
                return Err(Error::InvalidState(
                    "track has failed; create a new track".to_string(),
                ))
            }
        }
        st.transport = TransportState::Preparing;
        info!("Preparing track {} ({})", inner.id, inner.source.describe());

        let reader = SourceDecodeReader::open(&inner.source)?;
        let source_spec = reader.spec();
        let duration = reader.duration_seconds().unwrap_or(0.0);

        let device_spec = st.backend.open()?;
        let converter = FormatConverter::new(source_spec, device_spec)?;

        let shared = Arc::new(SessionShared::default());
        let tracker = Arc::new(PositionTracker::new(device_spec.sample_rate));
        let wiring = build_pool(
            inner.config.buffer_count,
            inner.config.buffer_frames,
            Arc::clone(&shared),
            Arc::clone(&inner.control),
        );

        inner
            .loops_remaining
            .store(inner.number_of_loops.load(Ordering::Relaxed), Ordering::Relaxed);

        let mut session = DecodeSession {
            source: inner.source.clone(),
            reader,
            converter,
            stash: Vec::new(),
            free: wiring.free,
            filled_tx: wiring.filled_tx,
            spent_rx: wiring.spent_rx,
            shared: Arc::clone(&shared),
            tracker: Arc::clone(&tracker),
            loops_remaining: Arc::clone(&inner.loops_remaining),
            pending_wraps: VecDeque::new(),
            draining: false,
            flushed: false,
            retried: false,
        };

        // Synchronous prefill: the device has data the instant it starts.
        session.refill(&inner.meter)?;

        st.backend.attach(wiring.head)?;

        let worker_state = Arc::new(WorkerState::new());
        // The worker must not keep the track alive: when the last handle
        // drops, the worker notices on its next tick and tears down.
        let worker_inner = Arc::downgrade(&self.inner);
        let worker_ws = Arc::clone(&worker_state);
        let worker_thread = thread::Builder::new()
            .name("tonearm-decode".to_string())
            .spawn(move || worker_loop(worker_inner, worker_ws, session))?;

        st.session = Some(SessionHandle {
            id: Uuid::new_v4(),
            shared,
            source_spec,
            duration,
            tracker,
            worker_state,
            worker_thread: Some(worker_thread),
        });
        st.transport = TransportState::ReadyToPlay;
        st.status = TrackStatus::ReadyToPlay;
        st.error = None;
        drop(st);

        info!(
            "Track {} ready: {} ({:.3}s) -> device {}",
            inner.id,
            source_spec,
            duration,
            device_spec
        );
        inner.events.emit(TrackEvent::SourceChanged {
            track_id: inner.id,
            duration,
            timestamp: chrono::Utc::now(),
        });
        Ok(())
    }

    /// Start or resume playback. Returns true when playing.
    pub fn play(&self) -> bool {
        let mut st = self.inner.state.lock().unwrap();
        match st.transport {
            TransportState::ReadyToPlay | TransportState::Paused => {
                st.scheduled_start = None;
                if let Err(e) = st.backend.start() {
                    warn!("Track {} could not start output: {}", self.inner.id, e);
                    return false;
                }
                st.transport = TransportState::Playing;
                st.interrupted = false;
                let position = st
                    .session
                    .as_ref()
                    .map(|s| {
                        s.shared.playing.store(true, Ordering::Relaxed);
                        s.tracker
                            .current_time(s.shared.frames_played.load(Ordering::Relaxed))
                    })
                    .unwrap_or(0.0);
                drop(st);

                debug!("Track {} playing from {:.3}s", self.inner.id, position);
                self.inner.events.emit(TrackEvent::StartedPlaying {
                    track_id: self.inner.id,
                    position,
                    timestamp: chrono::Utc::now(),
                });
                true
            }
            TransportState::Playing => true,
            _ => false,
        }
    }

    /// Start playback when the device clock reaches `device_time`.
    ///
    /// Decode prefill is not consumed while waiting. A deadline in the
    /// past plays immediately. Returns false when the track cannot play.
    pub fn play_at_time(&self, device_time: f64) -> bool {
        let (session_id, delay) = {
            let mut st = self.inner.state.lock().unwrap();
            if !matches!(
                st.transport,
                TransportState::ReadyToPlay | TransportState::Paused
            ) {
                return false;
            }
            let Some(session) = st.session.as_ref() else {
                return false;
            };
            let delay = device_time - st.backend.clock_now();
            if delay <= 0.0 {
                drop(st);
                return self.play();
            }
            let session_id = session.id;
            st.scheduled_start = Some(session_id);
            (session_id, delay)
        };

        let track = self.clone();
        let spawned = thread::Builder::new()
            .name("tonearm-start".to_string())
            .spawn(move || {
                thread::sleep(Duration::from_secs_f64(delay));
                track.fire_scheduled_start(session_id);
            });
        match spawned {
            Ok(_) => {
                debug!(
                    "Track {} scheduled to start in {:.3}s",
                    self.inner.id, delay
                );
                true
            }
            Err(e) => {
                warn!("Failed to schedule start: {}", e);
                self.inner.state.lock().unwrap().scheduled_start = None;
                false
            }
        }
    }

    fn fire_scheduled_start(&self, session_id: Uuid) {
        let armed = {
            let mut st = self.inner.state.lock().unwrap();
            let armed = st.scheduled_start == Some(session_id)
                && st.session.as_ref().map(|s| s.id) == Some(session_id)
                && matches!(
                    st.transport,
                    TransportState::ReadyToPlay | TransportState::Paused
                );
            if armed {
                st.scheduled_start = None;
            }
            armed
        };
        if armed {
            self.play();
        }
    }

    /// Pause playback; buffers stay enqueued, so resume is gapless.
    pub fn pause(&self) {
        let mut st = self.inner.state.lock().unwrap();
        if st.transport != TransportState::Playing {
            return;
        }
        if let Err(e) = st.backend.pause() {
            warn!("Track {} pause: {}", self.inner.id, e);
        }
        st.transport = TransportState::Paused;
        if let Some(session) = st.session.as_ref() {
            session.shared.playing.store(false, Ordering::Relaxed);
        }
        debug!("Track {} paused", self.inner.id);
    }

    /// Stop playback and tear the session down.
    ///
    /// Cancels in-flight decode/seek work (generation bump plus worker
    /// join) before the device side releases its buffers. The track can be
    /// prepared again afterwards.
    pub fn stop(&self) {
        let (worker_thread, emit_finished) = {
            let mut st = self.inner.state.lock().unwrap();
            match st.transport {
                TransportState::Failed | TransportState::Unprepared | TransportState::Stopped => {
                    return
                }
                _ => {}
            }
            let was_ended = st.transport == TransportState::Ended;

            if let Err(e) = st.backend.pause() {
                warn!("Track {} stop (pause): {}", self.inner.id, e);
            }

            let mut worker_thread = None;
            if let Some(mut session) = st.session.take() {
                session.shared.playing.store(false, Ordering::Relaxed);
                // Invalidate every in-flight buffer write and shadow seek.
                session.shared.generation.fetch_add(1, Ordering::AcqRel);
                session.worker_state.seek_seq.fetch_add(1, Ordering::AcqRel);
                session.worker_state.stop.store(true, Ordering::Release);
                session.worker_state.condvar.notify_one();
                worker_thread = session.worker_thread.take();
            }

            st.scheduled_start = None;
            st.interrupted = false;
            st.position_before_interruption = None;
            st.transport = TransportState::Stopped;
            st.status = TrackStatus::Unknown;
            st.error = None;
            (worker_thread, !was_ended)
        };

        if let Some(handle) = worker_thread {
            let _ = handle.join();
        }

        // Worker is gone; now the device side can release its buffers.
        {
            let mut st = self.inner.state.lock().unwrap();
            if let Err(e) = st.backend.stop() {
                warn!("Track {} stop (release): {}", self.inner.id, e);
            }
        }

        info!("Track {} stopped", self.inner.id);
        let now = chrono::Utc::now();
        self.inner.events.emit(TrackEvent::StoppedPlaying {
            track_id: self.inner.id,
            timestamp: now,
        });
        if emit_finished {
            self.inner.events.emit(TrackEvent::FinishedPlaying {
                track_id: self.inner.id,
                success: false,
                timestamp: now,
            });
        }
    }

    /// Request an asynchronous seek to `seconds`.
    ///
    /// The request builds a shadow decode context in the background;
    /// `current_time` snaps to the target when the shadow context is
    /// promoted. A failed seek leaves the position untouched and reports
    /// through the decode-error channel; it never fails the track.
    pub fn set_current_time(&self, seconds: f64) {
        let rejection = {
            let st = self.inner.state.lock().unwrap();
            if !matches!(
                st.transport,
                TransportState::ReadyToPlay | TransportState::Playing | TransportState::Paused
            ) {
                Some(format!(
                    "seek failed: not seekable while {}",
                    st.transport
                ))
            } else if let Some(session) = st.session.as_ref() {
                if seconds < 0.0 || (session.duration > 0.0 && seconds >= session.duration) {
                    Some(format!(
                        "seek failed: target {:.3}s outside [0, {:.3})",
                        seconds, session.duration
                    ))
                } else {
                    let seq = session.worker_state.seek_seq.fetch_add(1, Ordering::AcqRel) + 1;
                    session.worker_state.post(WorkerMsg::Seek {
                        target: seconds,
                        seq,
                    });
                    debug!(
                        "Track {} seek requested to {:.3}s (seq {})",
                        self.inner.id, seconds, seq
                    );
                    None
                }
            } else {
                Some("seek failed: no prepared session".to_string())
            }
        };

        if let Some(message) = rejection {
            warn!("Track {}: {}", self.inner.id, message);
            self.inner.events.emit(TrackEvent::DecodeError {
                track_id: self.inner.id,
                message,
                fatal: false,
                timestamp: chrono::Utc::now(),
            });
        }
    }

    /// Inject a device interruption signal.
    pub fn handle_interruption(&self, event: InterruptionEvent) {
        match event {
            InterruptionEvent::Began => {
                let position = {
                    let mut st = self.inner.state.lock().unwrap();
                    if st.transport != TransportState::Playing {
                        None
                    } else {
                        if let Err(e) = st.backend.pause() {
                            warn!("Track {} interruption pause: {}", self.inner.id, e);
                        }
                        st.transport = TransportState::Paused;
                        let position = st
                            .session
                            .as_ref()
                            .map(|s| {
                                s.shared.playing.store(false, Ordering::Relaxed);
                                s.tracker
                                    .current_time(s.shared.frames_played.load(Ordering::Relaxed))
                            })
                            .unwrap_or(0.0);
                        st.interrupted = true;
                        st.position_before_interruption = Some(position);
                        Some(position)
                    }
                };
                if let Some(position) = position {
                    info!(
                        "Track {} interrupted at {:.3}s",
                        self.inner.id, position
                    );
                    self.inner.events.emit(TrackEvent::InterruptionBegan {
                        track_id: self.inner.id,
                        position,
                        timestamp: chrono::Utc::now(),
                    });
                }
            }
            InterruptionEvent::Ended { should_resume } => {
                let resume = {
                    let mut st = self.inner.state.lock().unwrap();
                    let was_interrupted = st.interrupted;
                    st.interrupted = false;
                    was_interrupted
                        && should_resume
                        && st.transport == TransportState::Paused
                };
                self.inner.events.emit(TrackEvent::InterruptionEnded {
                    track_id: self.inner.id,
                    should_resume,
                    timestamp: chrono::Utc::now(),
                });
                if resume {
                    debug!("Track {} resuming after interruption", self.inner.id);
                    self.play();
                }
            }
        }
    }

    // ----------------------------------------
    // Introspection
    // ----------------------------------------

    pub fn status(&self) -> TrackStatus {
        self.inner.state.lock().unwrap().status
    }

    pub fn error(&self) -> Option<Arc<Error>> {
        self.inner.state.lock().unwrap().error.clone()
    }

    pub fn transport_state(&self) -> TransportState {
        self.inner.state.lock().unwrap().transport
    }

    pub fn is_playing(&self) -> bool {
        self.inner.state.lock().unwrap().transport == TransportState::Playing
    }

    /// Media duration in seconds (0.0 before prepare or when unknown).
    pub fn duration(&self) -> f64 {
        let st = self.inner.state.lock().unwrap();
        st.session.as_ref().map(|s| s.duration).unwrap_or(0.0)
    }

    /// Source channel count (0 before prepare).
    pub fn number_of_channels(&self) -> u16 {
        let st = self.inner.state.lock().unwrap();
        st.session
            .as_ref()
            .map(|s| s.source_spec.channels)
            .unwrap_or(0)
    }

    /// Current media position in seconds.
    pub fn current_time(&self) -> f64 {
        let st = self.inner.state.lock().unwrap();
        let Some(session) = st.session.as_ref() else {
            return 0.0;
        };
        if st.transport == TransportState::Ended && session.duration > 0.0 {
            return session.duration;
        }
        session
            .tracker
            .current_time(session.shared.frames_played.load(Ordering::Relaxed))
    }

    /// Monotonic output-device clock, independent of session state.
    pub fn device_current_time(&self) -> f64 {
        self.inner.state.lock().unwrap().backend.clock_now()
    }

    pub fn volume(&self) -> f32 {
        self.inner.control.volume()
    }

    /// Set playback gain in [0.0, 1.0]; applied in the render path.
    pub fn set_volume(&self, volume: f32) {
        self.inner.control.set_volume(volume);
    }

    pub fn pan(&self) -> f32 {
        self.inner.control.pan()
    }

    /// Set stereo pan in [-1.0, 1.0] (-1 left, 0 center, 1 right).
    pub fn set_pan(&self, pan: f32) {
        self.inner.control.set_pan(pan);
    }

    /// Loop count: -1 loops forever, 0 plays once, N plays N+1 times.
    pub fn number_of_loops(&self) -> i32 {
        self.inner.number_of_loops.load(Ordering::Relaxed)
    }

    pub fn set_number_of_loops(&self, loops: i32) {
        let loops = loops.max(-1);
        self.inner.number_of_loops.store(loops, Ordering::Relaxed);
        self.inner.loops_remaining.store(loops, Ordering::Relaxed);
    }

    pub fn is_metering_enabled(&self) -> bool {
        self.inner.meter.is_enabled()
    }

    pub fn set_metering_enabled(&self, enabled: bool) {
        self.inner.meter.set_enabled(enabled);
    }

    /// Refresh the meter snapshot the power getters read.
    pub fn update_meters(&self) {
        self.inner.meter.update();
    }

    /// Peak power for a channel, in decibels.
    pub fn peak_power_for_channel(&self, channel: usize) -> f32 {
        self.inner.meter.peak_db(channel)
    }

    /// Average power for a channel, in decibels.
    pub fn average_power_for_channel(&self, channel: usize) -> f32 {
        self.inner.meter.average_db(channel)
    }

    /// Position recorded when the last interruption began.
    pub fn position_before_interruption(&self) -> Option<f64> {
        self.inner
            .state
            .lock()
            .unwrap()
            .position_before_interruption
    }
}

// ========================================
// Decode worker
// ========================================

fn worker_loop(weak: Weak<TrackInner>, ws: Arc<WorkerState>, mut session: DecodeSession) {
    debug!("Decode worker started");
    let tick = {
        let Some(inner) = weak.upgrade() else { return };
        Duration::from_millis(inner.config.worker_tick_ms)
    };
    let mut last_underruns = 0u64;
    let mut consecutive_stalls = 0u32;

    loop {
        let msgs: Vec<WorkerMsg> = {
            let mut inbox = ws.inbox.lock().unwrap();
            if inbox.is_empty() && !ws.stop.load(Ordering::Acquire) {
                let (guard, _) = ws.condvar.wait_timeout(inbox, tick).unwrap();
                inbox = guard;
            }
            inbox.drain(..).collect()
        };

        if ws.stop.load(Ordering::Acquire) {
            break;
        }

        // The track itself may be gone; the session dies with it.
        let Some(inner) = weak.upgrade() else {
            debug!("Track dropped; decode worker exiting");
            break;
        };

        for msg in msgs {
            match msg {
                WorkerMsg::Seek { target, seq } => {
                    spawn_shadow_seek(&ws, &session.source, target, seq);
                }
                WorkerMsg::Promote {
                    reader,
                    target,
                    seq,
                } => {
                    if seq != ws.seek_seq.load(Ordering::Acquire) {
                        debug!("Discarding superseded seek completion (seq {})", seq);
                        continue;
                    }
                    match reader.and_then(|r| session.promote(r, target)) {
                        Ok(()) => {
                            consecutive_stalls = 0;
                            info!("Track {} seek promoted at {:.3}s", inner.id, target);
                        }
                        Err(e) => {
                            warn!("Track {} seek failed: {}", inner.id, e);
                            inner.events.emit(TrackEvent::DecodeError {
                                track_id: inner.id,
                                message: format!("seek failed: {}", e),
                                fatal: false,
                                timestamp: chrono::Utc::now(),
                            });
                        }
                    }
                }
            }
        }

        // Refill pass, with one transient reopen before going fatal.
        if let Err(e) = session.refill(&inner.meter) {
            if !session.retried {
                session.retried = true;
                warn!(
                    "Track {} decode error, attempting transient reopen: {}",
                    inner.id, e
                );
                inner.events.emit(TrackEvent::DecodeError {
                    track_id: inner.id,
                    message: e.to_string(),
                    fatal: false,
                    timestamp: chrono::Utc::now(),
                });
                if let Err(reopen) = session.reader.reopen_at_position() {
                    fail_track(
                        &inner,
                        Error::DecodeFailed(format!("reopen after decode error: {}", reopen)),
                    );
                    break;
                }
            } else {
                let fatal = match e {
                    Error::DecodeFailed(msg) => Error::DecodeFailed(msg),
                    other => Error::DecodeFailed(other.to_string()),
                };
                fail_track(&inner, fatal);
                break;
            }
        }

        // Loop wraps become official when they become audible.
        let played = session.shared.frames_played.load(Ordering::Relaxed);
        while let Some(&(wrap_frame, loops_left)) = session.pending_wraps.front() {
            if played < wrap_frame {
                break;
            }
            session.pending_wraps.pop_front();
            session.tracker.snap_to(0.0, wrap_frame);
            info!(
                "Track {} looped ({} loops remaining)",
                inner.id, loops_left
            );
            inner.events.emit(TrackEvent::Looped {
                track_id: inner.id,
                loops_remaining: loops_left,
                timestamp: chrono::Utc::now(),
            });
        }

        // Underrun watch: starved render passes while playing count as
        // stalls; a quiet tick clears the streak. Stalls are recoverable
        // until the configured bound.
        let underruns = session.shared.underruns.load(Ordering::Relaxed);
        if underruns > last_underruns {
            last_underruns = underruns;
            if session.shared.playing.load(Ordering::Relaxed) && !session.draining {
                consecutive_stalls += 1;
                warn!(
                    "Track {} output underrun (stall {}/{})",
                    inner.id, consecutive_stalls, inner.config.max_consecutive_underruns
                );
                inner.events.emit(TrackEvent::DecodeError {
                    track_id: inner.id,
                    message: format!("output underrun ({} consecutive)", consecutive_stalls),
                    fatal: false,
                    timestamp: chrono::Utc::now(),
                });
                if consecutive_stalls >= inner.config.max_consecutive_underruns {
                    fail_track(
                        &inner,
                        Error::DecodeFailed(format!(
                            "decode stalled: {} consecutive underruns",
                            consecutive_stalls
                        )),
                    );
                    break;
                }
            }
        } else {
            consecutive_stalls = 0;
        }

        // Natural completion: everything decoded has been rendered.
        if session.draining {
            let decoded = session.shared.frames_decoded.load(Ordering::Relaxed);
            if session.shared.frames_played.load(Ordering::Relaxed) >= decoded {
                finish_track(&inner);
                break;
            }
        }
    }

    debug!("Decode worker exiting");
}

/// Build a shadow decode context off-thread and post the completion back
/// to the worker inbox.
fn spawn_shadow_seek(ws: &Arc<WorkerState>, source: &TrackSource, target: f64, seq: u64) {
    let source = source.clone();
    let ws = Arc::clone(ws);
    let ws_closure = Arc::clone(&ws);
    let spawned = thread::Builder::new()
        .name("tonearm-seek".to_string())
        .spawn(move || {
            let reader = SourceDecodeReader::open_at(&source, target).map_err(|e| match e {
                Error::SeekFailed(msg) => Error::SeekFailed(msg),
                other => Error::SeekFailed(other.to_string()),
            });
            ws_closure.post(WorkerMsg::Promote {
                reader,
                target,
                seq,
            });
        });
    if let Err(e) = spawned {
        warn!("Failed to spawn seek thread: {}", e);
        ws.post(WorkerMsg::Promote {
            reader: Err(Error::SeekFailed(format!("spawn: {}", e))),
            target,
            seq,
        });
    }
}

/// Unrecoverable decode-path failure: terminal state, error populated.
fn fail_track(inner: &Arc<TrackInner>, error: Error) {
    let message = error.to_string();
    {
        let mut st = inner.state.lock().unwrap();
        // A concurrent stop already tore the session down; nothing to fail.
        if !matches!(
            st.transport,
            TransportState::Preparing
                | TransportState::ReadyToPlay
                | TransportState::Playing
                | TransportState::Paused
        ) {
            return;
        }
        error!("Track {} failed: {}", inner.id, message);
        st.transport = TransportState::Failed;
        st.status = TrackStatus::Failed;
        st.error = Some(Arc::new(error));
        if let Err(e) = st.backend.pause() {
            warn!("Track {} failure pause: {}", inner.id, e);
        }
        if let Some(session) = st.session.as_ref() {
            session.shared.playing.store(false, Ordering::Relaxed);
        }
    }
    let now = chrono::Utc::now();
    inner.events.emit(TrackEvent::DecodeError {
        track_id: inner.id,
        message,
        fatal: true,
        timestamp: now,
    });
    inner.events.emit(TrackEvent::FinishedPlaying {
        track_id: inner.id,
        success: false,
        timestamp: now,
    });
}

/// Natural end of stream with no loops remaining.
fn finish_track(inner: &Arc<TrackInner>) {
    let finished = {
        let mut st = inner.state.lock().unwrap();
        let finished = matches!(
            st.transport,
            TransportState::ReadyToPlay | TransportState::Playing | TransportState::Paused
        );
        if finished {
            st.transport = TransportState::Ended;
            if let Err(e) = st.backend.pause() {
                warn!("Track {} completion pause: {}", inner.id, e);
            }
            if let Some(session) = st.session.as_ref() {
                session.shared.playing.store(false, Ordering::Relaxed);
            }
        }
        finished
    };
    if finished {
        info!("Track {} finished playing", inner.id);
        inner.events.emit(TrackEvent::FinishedPlaying {
            track_id: inner.id,
            success: true,
            timestamp: chrono::Utc::now(),
        });
    }
}
