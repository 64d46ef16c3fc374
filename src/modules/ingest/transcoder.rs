//! Transcoder abstraction
//!
//! A transcoder consumes a live media byte stream and writes HLS output
//! into a directory. The ingest pipeline talks to it only through a
//! [`TranscodeHandle`]: a bounded input channel, an event stream and a
//! one-shot stop request. Implementations own the other end
//! ([`TranscoderEnd`]).

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::hwaccel::HwAccel;

/// Parameters for one transcode run
#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    /// Directory receiving playlist, init segment and media segments
    pub output_dir: PathBuf,
    pub hw_accel: HwAccel,
    /// Target media segment duration in seconds
    pub segment_seconds: u32,
    /// Number of segments kept in the playlist window
    pub playlist_size: u32,
    /// Label used in log lines
    pub session_label: String,
}

/// Lifecycle notifications from a running transcoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscoderEvent {
    Started,
    /// Runtime fault (process error, failed input write)
    Errored(String),
    /// Process ended; `None` when terminated by a signal
    Exited { code: Option<i32> },
}

/// Result of a non-blocking write
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted,
    /// Input is full; the chunk is handed back unchanged
    Backpressure(Bytes),
    /// Input is gone; the chunk is handed back unchanged
    Closed(Bytes),
}

#[derive(Debug, thiserror::Error)]
pub enum TranscoderError {
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transcoder process has no stdin")]
    MissingStdin,
}

/// Starts transcode runs
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn start(&self, config: TranscodeConfig) -> Result<TranscodeHandle, TranscoderError>;
}

/// Pipeline side of a running transcoder
#[derive(Debug)]
pub struct TranscodeHandle {
    input: Option<mpsc::Sender<Bytes>>,
    events: mpsc::UnboundedReceiver<TranscoderEvent>,
    stop: Option<oneshot::Sender<Duration>>,
}

/// Transcoder side of a running transcoder
#[derive(Debug)]
pub struct TranscoderEnd {
    /// Media chunks in arrival order; ends when the pipeline closes input
    pub input: mpsc::Receiver<Bytes>,
    pub events: mpsc::UnboundedSender<TranscoderEvent>,
    /// Stop request carrying the grace period; errors if the handle is dropped
    pub stop: oneshot::Receiver<Duration>,
}

impl TranscodeHandle {
    /// Create a connected handle pair with the given input capacity (in chunks)
    pub fn channel(capacity: usize) -> (TranscodeHandle, TranscoderEnd) {
        let (input_tx, input_rx) = mpsc::channel(capacity.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        (
            TranscodeHandle {
                input: Some(input_tx),
                events: events_rx,
                stop: Some(stop_tx),
            },
            TranscoderEnd {
                input: input_rx,
                events: events_tx,
                stop: stop_rx,
            },
        )
    }

    /// Offer a chunk without waiting
    pub fn write(&self, chunk: Bytes) -> WriteOutcome {
        let Some(input) = &self.input else {
            return WriteOutcome::Closed(chunk);
        };
        match input.try_send(chunk) {
            Ok(()) => WriteOutcome::Accepted,
            Err(mpsc::error::TrySendError::Full(chunk)) => WriteOutcome::Backpressure(chunk),
            Err(mpsc::error::TrySendError::Closed(chunk)) => WriteOutcome::Closed(chunk),
        }
    }

    /// Clone of the input sender, for waiting on capacity
    pub fn input_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.input.clone()
    }

    pub fn is_input_closed(&self) -> bool {
        self.input.as_ref().map_or(true, |input| input.is_closed())
    }

    /// Next lifecycle event; `None` once the transcoder side is gone
    pub async fn next_event(&mut self) -> Option<TranscoderEvent> {
        self.events.recv().await
    }

    /// Signal end of input
    pub fn close_input(&mut self) {
        self.input = None;
    }

    /// Ask the transcoder to stop within `grace`. Only the first call has effect.
    pub fn request_stop(&mut self, grace: Duration) {
        if let Some(stop) = self.stop.take() {
            // The transcoder may already have exited.
            let _ = stop.send(grace);
        }
    }
}
