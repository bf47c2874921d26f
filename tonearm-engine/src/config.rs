//! Engine configuration
//!
//! Tunables for the buffer pool, the decode worker, and the output device.
//! Values load from TOML or come from `Default`, which mirrors the sizing
//! of the original hardware playback queues (three in-flight buffers).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Playback engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Output device name (None = system default)
    pub device: Option<String>,

    /// Number of playback buffers in the pool
    pub buffer_count: usize,

    /// Capacity of each playback buffer, in frames
    pub buffer_frames: usize,

    /// Consecutive starved refill ticks tolerated before the track fails
    pub max_consecutive_underruns: u32,

    /// Whether level metering starts enabled
    pub metering: bool,

    /// Event bus capacity (events buffered per subscriber)
    pub event_capacity: usize,

    /// Decode worker poll interval in milliseconds
    pub worker_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: None,
            buffer_count: 3,
            buffer_frames: 4096,
            max_consecutive_underruns: 8,
            metering: false,
            event_capacity: 256,
            worker_tick_ms: 10,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// Missing keys fall back to defaults; the result is validated.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        let config: EngineConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_count < 2 {
            return Err(Error::Config(format!(
                "buffer_count must be at least 2, got {}",
                self.buffer_count
            )));
        }
        if self.buffer_frames == 0 {
            return Err(Error::Config("buffer_frames must be nonzero".to_string()));
        }
        if self.max_consecutive_underruns == 0 {
            return Err(Error::Config(
                "max_consecutive_underruns must be nonzero".to_string(),
            ));
        }
        if self.worker_tick_ms == 0 {
            return Err(Error::Config("worker_tick_ms must be nonzero".to_string()));
        }
        Ok(())
    }
}
