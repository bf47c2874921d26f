//! Source decode reader using symphonia
//!
//! Streams compressed media (MP3, FLAC, AAC, Vorbis, WAV, ...) into packets
//! of interleaved f32 PCM on demand. One reader is one decode context: the
//! transport keeps a primary reader on the refill path and builds a second,
//! independent reader (`open_at`) for every in-flight seek, so seeking
//! never disturbs the context feeding the output device.

use crate::audio::types::{AudioSpec, PcmChunk, TrackSource};
use crate::error::{Error, Result};
use std::fs::File;
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};
use tracing::{debug, trace, warn};

/// Result of one read from the decode reader.
pub enum ReadOutcome {
    /// A packet of decoded PCM in the source's native layout
    Decoded(PcmChunk),
    /// The source has no more packets
    EndOfStream,
}

/// Streaming decoder for one media source.
pub struct SourceDecodeReader {
    source: TrackSource,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    spec: AudioSpec,
    time_base: Option<TimeBase>,
    duration_frames: Option<u64>,
    /// Next frame this reader will produce (the decode cursor)
    position_frames: u64,
    /// Frames still to discard after a coarse container seek
    skip_frames: u64,
    sample_buf: Option<SampleBuffer<f32>>,
}

impl SourceDecodeReader {
    /// Open a decode context positioned at the start of the media.
    ///
    /// Probes the container, selects the first audio track, and builds a
    /// codec decoder. Probe or codec failures are `FormatUnsupported` and
    /// fatal to the session; missing files are `Io`.
    pub fn open(source: &TrackSource) -> Result<Self> {
        let mss = Self::media_source(source)?;

        let mut hint = Hint::new();
        if let Some(ext) = source
            .path()
            .and_then(|p| p.extension())
            .and_then(|e| e.to_str())
        {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| {
                Error::FormatUnsupported(format!("{}: probe failed: {}", source.describe(), e))
            })?;

        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| {
                Error::FormatUnsupported(format!("{}: no audio track", source.describe()))
            })?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let sample_rate = codec_params.sample_rate.ok_or_else(|| {
            Error::FormatUnsupported(format!("{}: sample rate not declared", source.describe()))
        })?;
        let channels = codec_params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| {
                Error::FormatUnsupported(format!("{}: channel count not declared", source.describe()))
            })?;
        if channels == 0 {
            return Err(Error::FormatUnsupported(format!(
                "{}: zero channels",
                source.describe()
            )));
        }

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| {
                Error::FormatUnsupported(format!("{}: no decoder: {}", source.describe(), e))
            })?;

        debug!(
            "Opened decode context: {} ({}Hz, {}ch, {:?} frames)",
            source.describe(),
            sample_rate,
            channels,
            codec_params.n_frames
        );

        Ok(Self {
            source: source.clone(),
            format,
            decoder,
            track_id,
            spec: AudioSpec::new(sample_rate, channels),
            time_base: codec_params.time_base,
            duration_frames: codec_params.n_frames,
            position_frames: 0,
            skip_frames: 0,
            sample_buf: None,
        })
    }

    /// Open an independent decode context positioned at `seconds`.
    ///
    /// This is the shadow-context constructor used by seeks: the returned
    /// reader is fully positioned (container seek plus sample-accurate
    /// decode-skip bookkeeping) and ready to feed the refill path the
    /// moment it is promoted to primary.
    pub fn open_at(source: &TrackSource, seconds: f64) -> Result<Self> {
        let mut reader = Self::open(source)?;
        if seconds > 0.0 {
            reader.seek_within(seconds)?;
        }
        Ok(reader)
    }

    fn media_source(source: &TrackSource) -> Result<MediaSourceStream> {
        let stream = match source {
            TrackSource::Path(path) => {
                let file = File::open(path)?;
                MediaSourceStream::new(Box::new(file), Default::default())
            }
            TrackSource::Memory(bytes) => {
                let cursor = Cursor::new(BytesSource(bytes.clone()));
                MediaSourceStream::new(Box::new(cursor), Default::default())
            }
        };
        Ok(stream)
    }

    /// Position the freshly opened context at `seconds`.
    ///
    /// The container seek lands on the nearest packet boundary at or before
    /// the target; the gap is recorded in `skip_frames` and discarded during
    /// the next reads so positioning is sample-accurate.
    fn seek_within(&mut self, seconds: f64) -> Result<()> {
        let target = Time::new(seconds.trunc() as u64, seconds.fract());
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: target,
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::SeekFailed(format!("seek to {:.3}s: {}", seconds, e)))?;

        // Codec state refers to pre-seek packets; drop it.
        self.decoder.reset();

        self.skip_frames = seeked.required_ts.saturating_sub(seeked.actual_ts);
        self.position_frames = self.frames_at_ts(seeked.required_ts, seconds);

        trace!(
            "Seek positioned at ts {} (required {}), skipping {} frames",
            seeked.actual_ts,
            seeked.required_ts,
            self.skip_frames
        );
        Ok(())
    }

    fn frames_at_ts(&self, ts: u64, fallback_seconds: f64) -> u64 {
        match self.time_base {
            Some(tb) => {
                let time = tb.calc_time(ts);
                ((time.seconds as f64 + time.frac) * self.spec.sample_rate as f64).round() as u64
            }
            None => (fallback_seconds * self.spec.sample_rate as f64).round() as u64,
        }
    }

    /// Decode the next packet, returning up to roughly `max_frames` frames.
    ///
    /// `max_frames` is advisory: a packet is never split, so a single read
    /// may return somewhat more. Corrupt packets are skipped with a warning;
    /// hard decoder errors surface as `DecodeFailed` for the caller's
    /// transient-retry policy.
    pub fn read_chunk(&mut self, max_frames: usize) -> Result<ReadOutcome> {
        let mut out: Vec<f32> = Vec::new();

        while out.len() < max_frames * self.spec.channels as usize {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(symphonia::core::errors::Error::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(symphonia::core::errors::Error::ResetRequired) => {
                    return Err(Error::DecodeFailed(format!(
                        "{}: stream reset required",
                        self.source.describe()
                    )));
                }
                Err(e) => {
                    return Err(Error::DecodeFailed(format!(
                        "{}: packet read: {}",
                        self.source.describe(),
                        e
                    )));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(symphonia::core::errors::Error::DecodeError(e)) => {
                    // One bad packet is not fatal; skip it.
                    warn!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => {
                    return Err(Error::DecodeFailed(format!(
                        "{}: decode: {}",
                        self.source.describe(),
                        e
                    )));
                }
            };

            if decoded.frames() == 0 {
                continue;
            }

            // Mid-stream format changes (chained streams) are legal; the
            // converter resets off the spec carried in each chunk.
            let packet_spec = decoded.spec();
            let packet_channels = packet_spec.channels.count() as u16;
            let packet_rate = packet_spec.rate;
            if packet_channels != self.spec.channels || packet_rate != self.spec.sample_rate {
                debug!(
                    "Source format changed mid-stream: {} -> {}Hz/{}ch",
                    self.spec, packet_rate, packet_channels
                );
                self.spec = AudioSpec::new(packet_rate, packet_channels);
            }

            let needs_new_buf = self
                .sample_buf
                .as_ref()
                .map(|b| b.capacity() < decoded.frames() * packet_channels as usize)
                .unwrap_or(true);
            if needs_new_buf {
                self.sample_buf = Some(SampleBuffer::new(
                    decoded.capacity() as u64,
                    *packet_spec,
                ));
            }
            let sample_buf = self.sample_buf.as_mut().unwrap();
            sample_buf.copy_interleaved_ref(decoded);
            let mut samples = sample_buf.samples();

            // Discard the decode-skip remainder of a coarse seek.
            if self.skip_frames > 0 {
                let skip_samples =
                    (self.skip_frames as usize * self.spec.channels as usize).min(samples.len());
                let skipped_frames = skip_samples / self.spec.channels as usize;
                samples = &samples[skip_samples..];
                self.skip_frames -= skipped_frames as u64;
            }

            if !samples.is_empty() {
                out.extend_from_slice(samples);
            }
        }

        if out.is_empty() {
            return Ok(ReadOutcome::EndOfStream);
        }

        let chunk = PcmChunk {
            samples: out,
            spec: self.spec,
        };
        self.position_frames += chunk.frames() as u64;
        Ok(ReadOutcome::Decoded(chunk))
    }

    /// Rebuild this context at its current position.
    ///
    /// Used once per failure as the transient-retry path before a decode
    /// error goes fatal.
    pub fn reopen_at_position(&mut self) -> Result<()> {
        let seconds = self.position_seconds();
        debug!(
            "Reopening decode context for {} at {:.3}s",
            self.source.describe(),
            seconds
        );
        *self = Self::open_at(&self.source, seconds)?;
        Ok(())
    }

    /// Source format as probed (updated on mid-stream changes).
    pub fn spec(&self) -> AudioSpec {
        self.spec
    }

    /// Total media length in source frames, when the container declares it.
    pub fn duration_frames(&self) -> Option<u64> {
        self.duration_frames
    }

    /// Total media length in seconds, when known.
    pub fn duration_seconds(&self) -> Option<f64> {
        self.duration_frames
            .map(|f| tonearm_common::timing::frames_to_seconds(f, self.spec.sample_rate))
    }

    /// Current decode position in seconds.
    pub fn position_seconds(&self) -> f64 {
        tonearm_common::timing::frames_to_seconds(self.position_frames, self.spec.sample_rate)
    }
}

/// Shared in-memory media bytes, readable by symphonia.
struct BytesSource(std::sync::Arc<Vec<u8>>);

impl AsRef<[u8]> for BytesSource {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_wav(dir: &tempfile::TempDir, seconds: f64, rate: u32) -> PathBuf {
        let path = dir.path().join("tone.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        let total = (seconds * rate as f64) as u32;
        for i in 0..total {
            let t = i as f32 / rate as f32;
            let sample = (t * 440.0 * 2.0 * std::f32::consts::PI).sin();
            writer.write_sample((sample * i16::MAX as f32 * 0.5) as i16).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn test_open_probes_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, 1.0, 8000);

        let reader = SourceDecodeReader::open(&TrackSource::Path(path)).unwrap();
        assert_eq!(reader.spec().sample_rate, 8000);
        assert_eq!(reader.spec().channels, 1);
        let duration = reader.duration_seconds().unwrap();
        assert!((duration - 1.0).abs() < 0.01, "duration = {}", duration);
    }

    #[test]
    fn test_open_garbage_is_format_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.dat");
        std::fs::write(&path, [0x13u8; 4096]).unwrap();

        let result = SourceDecodeReader::open(&TrackSource::Path(path));
        assert!(matches!(result, Err(Error::FormatUnsupported(_))));
    }

    #[test]
    fn test_open_missing_file_is_io() {
        let result =
            SourceDecodeReader::open(&TrackSource::Path(PathBuf::from("/nonexistent/a.wav")));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_read_until_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, 0.5, 8000);
        let mut reader = SourceDecodeReader::open(&TrackSource::Path(path)).unwrap();

        let mut frames = 0usize;
        loop {
            match reader.read_chunk(1024).unwrap() {
                ReadOutcome::Decoded(chunk) => frames += chunk.frames(),
                ReadOutcome::EndOfStream => break,
            }
        }
        assert_eq!(frames, 4000);
    }

    #[test]
    fn test_open_at_positions_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, 2.0, 8000);
        let source = TrackSource::Path(path);

        let mut reader = SourceDecodeReader::open_at(&source, 1.5).unwrap();
        assert!((reader.position_seconds() - 1.5).abs() < 0.05);

        // Remaining audio is half a second.
        let mut frames = 0usize;
        loop {
            match reader.read_chunk(1024).unwrap() {
                ReadOutcome::Decoded(chunk) => frames += chunk.frames(),
                ReadOutcome::EndOfStream => break,
            }
        }
        let remaining = frames as f64 / 8000.0;
        assert!((remaining - 0.5).abs() < 0.05, "remaining = {}", remaining);
    }

    #[test]
    fn test_memory_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, 0.25, 8000);
        let bytes = std::fs::read(&path).unwrap();

        let mut reader = SourceDecodeReader::open(&TrackSource::from(bytes)).unwrap();
        match reader.read_chunk(256).unwrap() {
            ReadOutcome::Decoded(chunk) => assert!(chunk.frames() > 0),
            ReadOutcome::EndOfStream => panic!("expected samples"),
        }
    }
}
