//! Output backends
//!
//! The engine is backend-agnostic: anything that can pull stereo frames
//! from a `RenderHead` at a steady pace can play a track. Two
//! implementations are provided, selected at track construction:
//!
//! - [`CpalBackend`]: a real audio device via cpal. The stream lives on a
//!   dedicated device thread (cpal streams are not `Send`); its callback
//!   only copies from the render head.
//! - [`QueueBackend`]: a virtual paced consumer. Used headless and by the
//!   integration tests, optionally at a multiple of real time.

use crate::audio::types::AudioSpec;
use crate::error::{Error, Result};
use crate::playback::buffer::RenderHead;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// An output device the transport can drive.
///
/// Lifecycle: `open` (probe the native format) -> `attach` (hand over the
/// render head) -> `start`/`pause` any number of times -> `stop` (release
/// the head and the device). `clock_now` is valid at any point and is
/// independent of session state.
pub trait OutputBackend: Send {
    /// Probe and reserve the output path; returns the device-native spec
    /// the decode pipeline must convert into.
    fn open(&mut self) -> Result<AudioSpec>;

    /// Hand the session's render head to the device.
    fn attach(&mut self, head: RenderHead) -> Result<()>;

    /// Begin (or resume) pulling audio.
    fn start(&mut self) -> Result<()>;

    /// Stop pulling audio without releasing anything.
    fn pause(&mut self) -> Result<()>;

    /// Release the render head and stop the device.
    fn stop(&mut self) -> Result<()>;

    /// Monotonic device clock, in seconds.
    fn clock_now(&self) -> f64;

    /// Whether the device has reported a stream error since the last open.
    fn has_error(&self) -> bool {
        false
    }
}

// ========================================
// CpalBackend
// ========================================

/// Frames rendered per callback slice; bounds the scratch buffer so the
/// callback never allocates.
const CALLBACK_CHUNK_FRAMES: usize = 4096;

enum DeviceCmd {
    Open {
        reply: mpsc::Sender<Result<AudioSpec>>,
    },
    Attach {
        head: Box<RenderHead>,
        reply: mpsc::Sender<Result<()>>,
    },
    Start {
        reply: mpsc::Sender<Result<()>>,
    },
    Pause {
        reply: mpsc::Sender<Result<()>>,
    },
    Release {
        reply: mpsc::Sender<Result<()>>,
    },
    Shutdown,
}

/// Real audio output through cpal.
///
/// All cpal objects live on one device thread because streams are not
/// `Send`; the backend itself is a thin command channel and can be owned
/// from any thread.
pub struct CpalBackend {
    cmd_tx: mpsc::Sender<DeviceCmd>,
    thread: Option<JoinHandle<()>>,
    error_flag: Arc<AtomicBool>,
    epoch: Instant,
}

impl CpalBackend {
    /// Create a backend for the named device (None = system default).
    pub fn new(device_name: Option<String>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let error_flag = Arc::new(AtomicBool::new(false));
        let thread_flag = Arc::clone(&error_flag);

        let thread = thread::Builder::new()
            .name("tonearm-device".to_string())
            .spawn(move || device_thread(cmd_rx, device_name, thread_flag))
            .expect("spawn device thread");

        Self {
            cmd_tx,
            thread: Some(thread),
            error_flag,
            epoch: Instant::now(),
        }
    }

    fn request<T>(&self, build: impl FnOnce(mpsc::Sender<Result<T>>) -> DeviceCmd) -> Result<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .map_err(|_| Error::AudioOutput("audio device thread is gone".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| Error::AudioOutput("audio device thread is gone".to_string()))?
    }
}

impl OutputBackend for CpalBackend {
    fn open(&mut self) -> Result<AudioSpec> {
        self.error_flag.store(false, Ordering::SeqCst);
        self.request(|reply| DeviceCmd::Open { reply })
    }

    fn attach(&mut self, head: RenderHead) -> Result<()> {
        self.request(|reply| DeviceCmd::Attach {
            head: Box::new(head),
            reply,
        })
    }

    fn start(&mut self) -> Result<()> {
        self.request(|reply| DeviceCmd::Start { reply })
    }

    fn pause(&mut self) -> Result<()> {
        self.request(|reply| DeviceCmd::Pause { reply })
    }

    fn stop(&mut self) -> Result<()> {
        self.request(|reply| DeviceCmd::Release { reply })
    }

    fn clock_now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn has_error(&self) -> bool {
        self.error_flag.load(Ordering::SeqCst)
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(DeviceCmd::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn device_thread(
    cmd_rx: mpsc::Receiver<DeviceCmd>,
    requested_name: Option<String>,
    error_flag: Arc<AtomicBool>,
) {
    let mut device: Option<Device> = None;
    let mut config: Option<StreamConfig> = None;
    let mut sample_format = SampleFormat::F32;
    let mut pending_head: Option<Box<RenderHead>> = None;
    let mut stream: Option<Stream> = None;

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            DeviceCmd::Open { reply } => {
                let result = open_device(requested_name.as_deref()).map(|(dev, cfg, fmt)| {
                    let spec = AudioSpec::new(cfg.sample_rate.0, 2);
                    device = Some(dev);
                    config = Some(cfg);
                    sample_format = fmt;
                    spec
                });
                let _ = reply.send(result);
            }
            DeviceCmd::Attach { head, reply } => {
                pending_head = Some(head);
                let _ = reply.send(Ok(()));
            }
            DeviceCmd::Start { reply } => {
                let result = (|| {
                    if stream.is_none() {
                        let (Some(dev), Some(cfg)) = (device.as_ref(), config.as_ref()) else {
                            return Err(Error::InvalidState(
                                "output device not opened".to_string(),
                            ));
                        };
                        let head = pending_head.take().ok_or_else(|| {
                            Error::InvalidState("no render head attached".to_string())
                        })?;
                        let built = build_stream_for(
                            dev,
                            cfg,
                            sample_format,
                            *head,
                            Arc::clone(&error_flag),
                        )?;
                        stream = Some(built);
                        info!("Audio stream created ({:?})", sample_format);
                    }
                    stream
                        .as_ref()
                        .expect("stream just created")
                        .play()
                        .map_err(|e| Error::AudioOutput(format!("failed to start stream: {}", e)))
                })();
                let _ = reply.send(result);
            }
            DeviceCmd::Pause { reply } => {
                let result = match stream.as_ref() {
                    Some(stream) => stream
                        .pause()
                        .map_err(|e| Error::AudioOutput(format!("failed to pause stream: {}", e))),
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            DeviceCmd::Release { reply } => {
                if let Some(stream) = stream.take() {
                    let _ = stream.pause();
                    drop(stream);
                    debug!("Audio stream released");
                }
                pending_head = None;
                let _ = reply.send(Ok(()));
            }
            DeviceCmd::Shutdown => break,
        }
    }
}

/// Open the requested device, falling back to the default device when the
/// named one is missing.
fn open_device(requested: Option<&str>) -> Result<(Device, StreamConfig, SampleFormat)> {
    let host = cpal::default_host();

    let device = match requested {
        Some(name) => {
            let mut devices = host
                .output_devices()
                .map_err(|e| Error::AudioOutput(format!("failed to enumerate devices: {}", e)))?;
            match devices.find(|d| d.name().ok().as_deref() == Some(name)) {
                Some(dev) => {
                    info!("Using requested audio device: {}", name);
                    dev
                }
                None => {
                    warn!(
                        "Requested device '{}' not found, falling back to default device",
                        name
                    );
                    host.default_output_device().ok_or_else(|| {
                        Error::AudioOutput(format!(
                            "device '{}' not found and no default device available",
                            name
                        ))
                    })?
                }
            }
        }
        None => host
            .default_output_device()
            .ok_or_else(|| Error::AudioOutput("no default output device".to_string()))?,
    };

    let (config, sample_format) = best_config(&device)?;
    debug!(
        "Audio config: sample_rate={}, channels={}, format={:?}",
        config.sample_rate.0, config.channels, sample_format
    );
    Ok((device, config, sample_format))
}

/// Prefer 44.1 kHz stereo f32; otherwise take the device default.
fn best_config(device: &Device) -> Result<(StreamConfig, SampleFormat)> {
    let mut supported = device
        .supported_output_configs()
        .map_err(|e| Error::AudioOutput(format!("failed to get device configs: {}", e)))?;

    let preferred = supported.find(|range| {
        range.channels() == 2
            && range.min_sample_rate().0 <= 44100
            && range.max_sample_rate().0 >= 44100
            && range.sample_format() == SampleFormat::F32
    });

    if let Some(range) = preferred {
        let sample_format = range.sample_format();
        let config = range.with_sample_rate(cpal::SampleRate(44100)).config();
        return Ok((config, sample_format));
    }

    let default = device
        .default_output_config()
        .map_err(|e| Error::AudioOutput(format!("failed to get default config: {}", e)))?;
    let sample_format = default.sample_format();
    Ok((default.config(), sample_format))
}

fn build_stream_for(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    head: RenderHead,
    error_flag: Arc<AtomicBool>,
) -> Result<Stream> {
    match sample_format {
        SampleFormat::F32 => build_stream::<f32>(device, config, head, error_flag),
        SampleFormat::I16 => build_stream::<i16>(device, config, head, error_flag),
        SampleFormat::U16 => build_stream::<u16>(device, config, head, error_flag),
        other => Err(Error::AudioOutput(format!(
            "unsupported device sample format: {:?}",
            other
        ))),
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut head: RenderHead,
    error_flag: Arc<AtomicBool>,
) -> Result<Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch = vec![0.0f32; CALLBACK_CHUNK_FRAMES * 2];

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                let mut done = 0usize;
                while done < frames {
                    let n = (frames - done).min(CALLBACK_CHUNK_FRAMES);
                    let slice = &mut scratch[..n * 2];
                    head.render(slice);

                    for i in 0..n {
                        let left = slice[i * 2];
                        let right = slice[i * 2 + 1];
                        let frame = &mut data[(done + i) * channels..(done + i + 1) * channels];
                        if channels == 1 {
                            frame[0] = T::from_sample(0.5 * (left + right));
                        } else {
                            frame[0] = T::from_sample(left);
                            frame[1] = T::from_sample(right);
                            for sample in frame.iter_mut().skip(2) {
                                *sample = T::from_sample(0.0f32);
                            }
                        }
                    }
                    done += n;
                }
            },
            move |err| {
                error!("Audio stream error: {} - flagging for the engine", err);
                error_flag.store(true, Ordering::SeqCst);
            },
            None,
        )
        .map_err(|e| Error::AudioOutput(format!("failed to build stream: {}", e)))?;

    Ok(stream)
}

// ========================================
// QueueBackend
// ========================================

/// Frames consumed per pacer tick.
const QUEUE_CHUNK_FRAMES: usize = 512;

struct QueueCtl {
    running: AtomicBool,
    shutdown: AtomicBool,
}

/// Virtual output device: a paced consumer thread standing in for real
/// hardware.
///
/// Drives the same render head as `CpalBackend`, so the whole pipeline --
/// refill, underrun accounting, stale-buffer discard, drain detection --
/// behaves identically headless. `multiplier` scales consumption relative
/// to real time (media-time accounting is frame-based and unaffected).
pub struct QueueBackend {
    spec: AudioSpec,
    multiplier: f64,
    ctl: Arc<QueueCtl>,
    thread: Option<JoinHandle<()>>,
    epoch: Instant,
}

impl QueueBackend {
    /// Real-time paced virtual device with the given native spec.
    pub fn new(spec: AudioSpec) -> Self {
        Self::with_multiplier(spec, 1.0)
    }

    /// Virtual device consuming at `multiplier` times real time.
    pub fn with_multiplier(spec: AudioSpec, multiplier: f64) -> Self {
        Self {
            spec,
            multiplier: multiplier.max(0.01),
            ctl: Arc::new(QueueCtl {
                running: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
            thread: None,
            epoch: Instant::now(),
        }
    }
}

impl OutputBackend for QueueBackend {
    fn open(&mut self) -> Result<AudioSpec> {
        Ok(self.spec)
    }

    fn attach(&mut self, mut head: RenderHead) -> Result<()> {
        if self.thread.is_some() {
            return Err(Error::InvalidState(
                "queue backend already has a render head".to_string(),
            ));
        }

        self.ctl.shutdown.store(false, Ordering::SeqCst);
        let ctl = Arc::clone(&self.ctl);
        let tick = Duration::from_secs_f64(
            QUEUE_CHUNK_FRAMES as f64 / self.spec.sample_rate as f64 / self.multiplier,
        );

        let thread = thread::Builder::new()
            .name("tonearm-output".to_string())
            .spawn(move || {
                let mut scratch = vec![0.0f32; QUEUE_CHUNK_FRAMES * 2];
                loop {
                    if ctl.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    if !ctl.running.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_micros(500));
                        continue;
                    }
                    head.render(&mut scratch);
                    thread::sleep(tick);
                }
            })
            .map_err(|e| Error::AudioOutput(format!("failed to spawn pacer thread: {}", e)))?;

        self.thread = Some(thread);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.ctl.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.ctl.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.ctl.running.store(false, Ordering::SeqCst);
        self.ctl.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        Ok(())
    }

    fn clock_now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

impl Drop for QueueBackend {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::buffer::{build_pool, ControlShared, SessionShared};
    use ringbuf::traits::*;

    #[test]
    fn test_queue_backend_consumes_when_started() {
        let session = Arc::new(SessionShared::default());
        let control = Arc::new(ControlShared::new());
        let mut wiring = build_pool(2, 256, Arc::clone(&session), control);

        let mut buf = wiring.free.pop().unwrap();
        buf.begin_fill(0);
        buf.push_frames(&vec![0.5f32; 256 * 2]);
        session
            .frames_decoded
            .fetch_add(256, Ordering::Relaxed);
        wiring.filled_tx.try_push(buf).ok().unwrap();

        let mut backend = QueueBackend::with_multiplier(AudioSpec::new(8000, 2), 100.0);
        assert_eq!(backend.open().unwrap(), AudioSpec::new(8000, 2));
        backend.attach(wiring.head).unwrap();

        // Not started yet: nothing consumed.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(session.frames_played.load(Ordering::Relaxed), 0);

        backend.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while session.frames_played.load(Ordering::Relaxed) < 256 {
            assert!(Instant::now() < deadline, "pacer never consumed the buffer");
            thread::sleep(Duration::from_millis(1));
        }

        backend.stop().unwrap();
    }

    #[test]
    fn test_queue_backend_clock_is_monotonic() {
        let backend = QueueBackend::new(AudioSpec::new(44100, 2));
        let a = backend.clock_now();
        thread::sleep(Duration::from_millis(5));
        let b = backend.clock_now();
        assert!(b > a);
    }

    #[test]
    fn test_queue_backend_double_attach_rejected() {
        let session = Arc::new(SessionShared::default());
        let control = Arc::new(ControlShared::new());
        let wiring = build_pool(2, 64, Arc::clone(&session), Arc::clone(&control));
        let wiring2 = build_pool(2, 64, session, control);

        let mut backend = QueueBackend::with_multiplier(AudioSpec::new(8000, 2), 10.0);
        backend.attach(wiring.head).unwrap();
        let result = backend.attach(wiring2.head);
        assert!(matches!(result, Err(Error::InvalidState(_))));
        backend.stop().unwrap();
    }
}
