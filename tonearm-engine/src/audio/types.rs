//! Core audio data types
//!
//! Sources, format descriptors, and the decoded-PCM chunk passed from the
//! decode reader to the format converter.

use std::path::PathBuf;
use std::sync::Arc;

/// Where the compressed media comes from.
///
/// Cloning is cheap: in-memory sources share their bytes.
#[derive(Debug, Clone)]
pub enum TrackSource {
    /// A file on disk
    Path(PathBuf),
    /// Encoded media held in memory
    Memory(Arc<Vec<u8>>),
}

impl TrackSource {
    /// Short human-readable description for logging.
    pub fn describe(&self) -> String {
        match self {
            TrackSource::Path(path) => path.display().to_string(),
            TrackSource::Memory(bytes) => format!("<memory: {} bytes>", bytes.len()),
        }
    }

    /// File path, when the source is a file.
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            TrackSource::Path(path) => Some(path),
            TrackSource::Memory(_) => None,
        }
    }
}

impl From<PathBuf> for TrackSource {
    fn from(path: PathBuf) -> Self {
        TrackSource::Path(path)
    }
}

impl From<Vec<u8>> for TrackSource {
    fn from(bytes: Vec<u8>) -> Self {
        TrackSource::Memory(Arc::new(bytes))
    }
}

/// A sample rate and channel count pair.
///
/// Describes either a source stream (as probed) or the output device's
/// native layout. Fixed per session once probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpec {
    /// Frames per second
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u16,
}

impl AudioSpec {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

impl std::fmt::Display for AudioSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}Hz/{}ch", self.sample_rate, self.channels)
    }
}

/// One packet's worth of decoded PCM in the source's native layout.
///
/// Samples are interleaved f32 in [-1.0, 1.0].
#[derive(Debug, Clone)]
pub struct PcmChunk {
    /// Interleaved samples
    pub samples: Vec<f32>,
    /// Layout of `samples`
    pub spec: AudioSpec,
}

impl PcmChunk {
    /// Number of frames in the chunk.
    pub fn frames(&self) -> usize {
        if self.spec.channels == 0 {
            return 0;
        }
        self.samples.len() / self.spec.channels as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_describe() {
        let src = TrackSource::Path(PathBuf::from("/music/a.flac"));
        assert_eq!(src.describe(), "/music/a.flac");

        let src: TrackSource = vec![0u8; 128].into();
        assert_eq!(src.describe(), "<memory: 128 bytes>");
        assert!(src.path().is_none());
    }

    #[test]
    fn test_chunk_frames() {
        let chunk = PcmChunk {
            samples: vec![0.0; 12],
            spec: AudioSpec::new(44100, 2),
        };
        assert_eq!(chunk.frames(), 6);
    }

    #[test]
    fn test_spec_display() {
        assert_eq!(AudioSpec::new(48000, 2).to_string(), "48000Hz/2ch");
    }
}
