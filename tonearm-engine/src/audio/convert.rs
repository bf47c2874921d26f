//! Format conversion to the output device layout
//!
//! Converts decoded source PCM (any rate, any channel count) into the
//! device's interleaved layout: channel remap first (mono duplicated,
//! multi-channel averaged down to stereo), then rubato resampling when the
//! rates differ. The converter is streaming: rubato wants fixed-size input
//! chunks, so a carry holds the remainder between calls and `flush` drains
//! it at end of stream.

use crate::audio::types::{AudioSpec, PcmChunk};
use crate::error::{Error, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::debug;

/// Frames fed to the resampler per process call
const RESAMPLE_CHUNK_FRAMES: usize = 1024;

/// Streaming converter from one source format to the device format.
pub struct FormatConverter {
    source: AudioSpec,
    target: AudioSpec,
    /// None when no rate change is needed
    resampler: Option<FastFixedIn<f32>>,
    /// Planar target-channel-count input awaiting a full resampler chunk
    carry: Vec<Vec<f32>>,
}

impl FormatConverter {
    /// Build a converter between `source` and `target` layouts.
    ///
    /// Fails with `FormatUnsupported` when no conversion path exists; this
    /// is fatal to the session.
    pub fn new(source: AudioSpec, target: AudioSpec) -> Result<Self> {
        if source.channels == 0 || source.sample_rate == 0 {
            return Err(Error::FormatUnsupported(format!(
                "source format {} is not convertible",
                source
            )));
        }
        if target.channels == 0 || target.sample_rate == 0 {
            return Err(Error::FormatUnsupported(format!(
                "device format {} is not usable",
                target
            )));
        }

        let resampler = if source.sample_rate != target.sample_rate {
            let ratio = target.sample_rate as f64 / source.sample_rate as f64;
            let resampler = FastFixedIn::<f32>::new(
                ratio,
                1.0,
                PolynomialDegree::Septic,
                RESAMPLE_CHUNK_FRAMES,
                target.channels as usize,
            )
            .map_err(|e| {
                Error::FormatUnsupported(format!(
                    "no resampling path {} -> {}: {}",
                    source, target, e
                ))
            })?;
            debug!(
                "Resampling {} Hz -> {} Hz ({} channels)",
                source.sample_rate, target.sample_rate, target.channels
            );
            Some(resampler)
        } else {
            None
        };

        Ok(Self {
            source,
            target,
            resampler,
            carry: vec![Vec::new(); target.channels as usize],
        })
    }

    /// Rebuild conversion state for a new source format.
    ///
    /// Called after a seek promotion and whenever the source format changes
    /// mid-stream; pending carry from the old format is discarded.
    pub fn reset(&mut self, source: AudioSpec) -> Result<()> {
        *self = Self::new(source, self.target)?;
        Ok(())
    }

    /// Source format this converter currently accepts.
    pub fn source_spec(&self) -> AudioSpec {
        self.source
    }

    /// Convert one decoded chunk into interleaved device-layout samples.
    ///
    /// May return fewer frames than went in (the resampler holds carry and
    /// priming delay) or none at all early on; `flush` retrieves the tail.
    pub fn convert(&mut self, chunk: &PcmChunk) -> Result<Vec<f32>> {
        if chunk.spec != self.source {
            debug!(
                "Converter reset for format change: {} -> {}",
                self.source, chunk.spec
            );
            self.reset(chunk.spec)?;
        }

        let planar = self.remap_channels(&chunk.samples);

        if self.resampler.is_none() {
            return Ok(Self::interleave(&planar));
        }

        for (carry, channel) in self.carry.iter_mut().zip(planar) {
            carry.extend(channel);
        }
        self.drain_full_chunks()
    }

    /// Drain everything still buffered, including the resampler tail.
    ///
    /// Call exactly once when the source reaches end of stream; the
    /// converter resets its carry and can be reused afterwards.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        if self.resampler.is_none() {
            return Ok(Vec::new());
        }

        let mut out = self.drain_full_chunks()?;

        let resampler = self.resampler.as_mut().unwrap();
        if !self.carry[0].is_empty() {
            let partial = resampler
                .process_partial(Some(&self.carry), None)
                .map_err(|e| Error::DecodeFailed(format!("resampler flush: {}", e)))?;
            out.extend(Self::interleave(&partial));
            for carry in &mut self.carry {
                carry.clear();
            }
        }

        // Drain the filter delay line.
        let tail = resampler
            .process_partial::<Vec<f32>>(None, None)
            .map_err(|e| Error::DecodeFailed(format!("resampler drain: {}", e)))?;
        out.extend(Self::interleave(&tail));

        Ok(out)
    }

    fn drain_full_chunks(&mut self) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        while self.carry[0].len() >= RESAMPLE_CHUNK_FRAMES {
            let input: Vec<Vec<f32>> = self
                .carry
                .iter_mut()
                .map(|c| c.drain(..RESAMPLE_CHUNK_FRAMES).collect())
                .collect();

            let output = resampler
                .process(&input, None)
                .map_err(|e| Error::DecodeFailed(format!("resampling: {}", e)))?;
            out.extend(Self::interleave(&output));
        }
        Ok(out)
    }

    /// Remap interleaved source samples to planar target channels.
    ///
    /// Mono duplicates into every target channel; wider sources fold the
    /// even-indexed channels into left and the odd-indexed into right.
    fn remap_channels(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        let src_ch = self.source.channels as usize;
        let dst_ch = self.target.channels as usize;
        let frames = samples.len() / src_ch;

        let mut planar = vec![Vec::with_capacity(frames); dst_ch];

        match src_ch {
            1 => {
                for &sample in samples {
                    for channel in planar.iter_mut() {
                        channel.push(sample);
                    }
                }
            }
            n if n == dst_ch => {
                for frame in samples.chunks_exact(src_ch) {
                    for (channel, &sample) in planar.iter_mut().zip(frame) {
                        channel.push(sample);
                    }
                }
            }
            _ => {
                // Fold down to stereo by averaging alternating channels.
                let left_count = src_ch.div_ceil(2) as f32;
                let right_count = (src_ch / 2).max(1) as f32;
                for frame in samples.chunks_exact(src_ch) {
                    let mut left = 0.0;
                    let mut right = 0.0;
                    for (idx, &sample) in frame.iter().enumerate() {
                        if idx % 2 == 0 {
                            left += sample;
                        } else {
                            right += sample;
                        }
                    }
                    left /= left_count;
                    right /= right_count;
                    for (idx, channel) in planar.iter_mut().enumerate() {
                        channel.push(if idx % 2 == 0 { left } else { right });
                    }
                }
            }
        }

        planar
    }

    /// Convert planar samples to interleaved format.
    fn interleave(planar: &[Vec<f32>]) -> Vec<f32> {
        if planar.is_empty() {
            return Vec::new();
        }
        let channels = planar.len();
        let frames = planar[0].len();
        let mut interleaved = Vec::with_capacity(frames * channels);
        for frame_idx in 0..frames {
            for channel in planar {
                interleaved.push(channel[frame_idx]);
            }
        }
        interleaved
    }
}
