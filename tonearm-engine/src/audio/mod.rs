//! Audio decode, conversion, and output device modules

pub mod convert;
pub mod output;
pub mod reader;
pub mod types;

pub use convert::FormatConverter;
pub use output::{CpalBackend, OutputBackend, QueueBackend};
pub use reader::{ReadOutcome, SourceDecodeReader};
pub use types::{AudioSpec, PcmChunk, TrackSource};
