//! Live ingest into an external transcoder
//!
//! ## Architecture
//!
//! - `transcoder.rs` - Transcoder capability, handle and lifecycle events
//! - `ffmpeg.rs` - ffmpeg subprocess implementation writing fMP4 HLS output
//! - `hwaccel.rs` - H.264 encoder selection from host devices
//! - `pipeline.rs` - Per-connection state machine with ordering and backpressure

pub mod ffmpeg;
pub mod hwaccel;
pub mod pipeline;
pub mod transcoder;

pub use ffmpeg::FfmpegTranscoder;
pub use hwaccel::HwAccel;
pub use pipeline::{IngestError, IngestPipeline, IngestSettings, IngestSignal, IngestState};
pub use transcoder::{
    TranscodeConfig, TranscodeHandle, Transcoder, TranscoderEnd, TranscoderError, TranscoderEvent,
    WriteOutcome,
};
