//! Per-connection ingest pipeline
//!
//! Drives one transcoder run for one producer connection:
//!
//! ```text
//! Idle --first chunk--> Starting --launched--> Running --exit/failure--> Stopped
//!                           \--launch failed--------------------------> Stopped
//! ```
//!
//! Chunks are forwarded strictly in arrival order. When the transcoder input
//! is saturated, chunks wait in a FIFO queue that drains as capacity
//! returns; past a high-water mark `on_data` throttles the producer instead
//! of growing the queue without bound.

use bytes::Bytes;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{OwnedPermit, Sender};
use tokio::time::Instant;

use super::hwaccel::HwAccel;
use super::transcoder::{
    TranscodeConfig, TranscodeHandle, Transcoder, TranscoderError, TranscoderEvent, WriteOutcome,
};
use crate::modules::registry::SessionId;

/// Reason sent to the producer when the transcoder cannot be run
pub const PROCESSING_ERROR: &str = "An error occurred while processing the stream.";
/// Reason sent to the producer when the transcoder exits on its own
pub const UNEXPECTED_EXIT: &str = "The streaming process ended unexpectedly.";
/// Reason sent to the producer when media cannot be delivered to the transcoder
pub const DATA_ERROR: &str = "Unable to process stream data.";

/// Extra time allowed, beyond the grace period, for the exit event to arrive
const EXIT_WAIT_MARGIN: Duration = Duration::from_secs(1);

/// How long a write that found the input closed waits for the exit status
const CLOSED_INPUT_EXIT_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Idle,
    Starting,
    Running,
    Stopped,
}

/// Terminal outcome of a transcoder run, reported at most once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestSignal {
    /// Transcoder finished normally
    Ended,
    /// Ingest failed; carries the reason for the producer
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Transcoder launch failed: {0}")]
    Launch(#[from] TranscoderError),

    #[error("Failed to create output directory: {0}")]
    OutputDir(#[source] std::io::Error),

    #[error("Transcoder input is closed")]
    InputClosed,

    #[error("Transcoder exited with code {0}")]
    Exited(i32),

    #[error("Transcoder input stalled for {0:?}")]
    Stalled(Duration),

    #[error("Ingest already stopped")]
    Stopped,
}

impl IngestError {
    /// Human-readable reason for the producer
    pub fn producer_reason(&self) -> &'static str {
        match self {
            IngestError::Launch(_) | IngestError::OutputDir(_) => PROCESSING_ERROR,
            IngestError::Exited(_) => UNEXPECTED_EXIT,
            IngestError::InputClosed | IngestError::Stalled(_) | IngestError::Stopped => DATA_ERROR,
        }
    }
}

/// Settings shared by all pipelines
#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Parent of the per-session output directories
    pub media_root: PathBuf,
    /// Forced encoder profile; probed per launch when `None`
    pub hw_accel: Option<HwAccel>,
    pub segment_seconds: u32,
    pub playlist_size: u32,
    /// Time the transcoder gets to exit after a stop request
    pub shutdown_grace: Duration,
    /// Queued bytes above which `on_data` waits for the transcoder
    pub max_pending_bytes: usize,
    /// Longest `on_data` may wait for the transcoder to accept input
    pub write_timeout: Duration,
}

impl Default for IngestSettings {
    fn default() -> Self {
        IngestSettings {
            media_root: PathBuf::from("media"),
            hw_accel: None,
            segment_seconds: 4,
            playlist_size: 10,
            shutdown_grace: Duration::from_secs(5),
            max_pending_bytes: 8 * 1024 * 1024,
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl IngestSettings {
    pub fn output_dir(&self, session_id: &SessionId) -> PathBuf {
        self.media_root.join(session_id.as_str())
    }
}

enum Wake {
    Capacity(Option<OwnedPermit<Bytes>>),
    Event(Option<TranscoderEvent>),
}

async fn reserve(sender: Option<Sender<Bytes>>) -> Option<OwnedPermit<Bytes>> {
    sender?.reserve_owned().await.ok()
}

pub struct IngestPipeline {
    session_id: SessionId,
    settings: Arc<IngestSettings>,
    transcoder: Arc<dyn Transcoder>,
    state: IngestState,
    handle: Option<TranscodeHandle>,
    pending: VecDeque<Bytes>,
    pending_bytes: usize,
    stopping: bool,
    signalled: bool,
}

impl IngestPipeline {
    pub fn new(
        session_id: SessionId,
        settings: Arc<IngestSettings>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        IngestPipeline {
            session_id,
            settings,
            transcoder,
            state: IngestState::Idle,
            handle: None,
            pending: VecDeque::new(),
            pending_bytes: 0,
            stopping: false,
            signalled: false,
        }
    }

    pub fn state(&self) -> IngestState {
        self.state
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Number of chunks waiting for transcoder capacity
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Accept a media chunk from the producer.
    ///
    /// The first call launches the transcoder. Saturation is not an error:
    /// the chunk is queued, and the call only waits once the queue passes
    /// the high-water mark.
    pub async fn on_data(&mut self, chunk: Bytes) -> Result<(), IngestError> {
        match self.state {
            IngestState::Stopped => return Err(IngestError::Stopped),
            IngestState::Idle => self.launch().await?,
            IngestState::Starting | IngestState::Running => {}
        }
        if chunk.is_empty() {
            return Ok(());
        }

        self.pending_bytes += chunk.len();
        self.pending.push_back(chunk);

        if let Err(e) = self.flush() {
            let e = self.explain_closed_input(e).await;
            self.abort();
            return Err(e);
        }
        if self.pending_bytes > self.settings.max_pending_bytes {
            let deadline = Instant::now() + self.settings.write_timeout;
            if let Err(e) = self.drain_until(self.settings.max_pending_bytes, deadline).await {
                let e = self.explain_closed_input(e).await;
                log::warn!("[{}] Ingest stalled: {}", self.session_id, e);
                self.abort();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Wait for the transcoder's terminal outcome.
    ///
    /// Drains queued chunks while waiting. Cancel-safe, so it can sit in a
    /// `select!` next to the producer socket. Resolves at most once per
    /// pipeline; afterwards, and before launch, it never resolves.
    pub async fn next_signal(&mut self) -> IngestSignal {
        loop {
            if self.signalled {
                return std::future::pending().await;
            }
            let wake = {
                let Some(handle) = self.handle.as_mut() else {
                    return std::future::pending().await;
                };
                let drain = if self.pending.is_empty() || handle.is_input_closed() {
                    None
                } else {
                    handle.input_sender()
                };
                let can_drain = drain.is_some();

                tokio::select! {
                    permit = reserve(drain), if can_drain => Wake::Capacity(permit),
                    event = handle.next_event() => Wake::Event(event),
                }
            };

            match wake {
                Wake::Capacity(Some(permit)) => {
                    if let Some(chunk) = self.pending.pop_front() {
                        self.pending_bytes -= chunk.len();
                        permit.send(chunk);
                    }
                    if self.flush().is_err() && !self.stopping {
                        return self.fail(DATA_ERROR);
                    }
                }
                // Input closed; the exit event follows.
                Wake::Capacity(None) => {}
                Wake::Event(Some(TranscoderEvent::Started)) => {
                    log::debug!("[{}] Transcoder running", self.session_id);
                }
                Wake::Event(Some(TranscoderEvent::Errored(reason))) => {
                    log::error!("[{}] Transcoder error: {}", self.session_id, reason);
                    if !self.stopping {
                        return self.fail(PROCESSING_ERROR);
                    }
                }
                Wake::Event(Some(TranscoderEvent::Exited { code })) => {
                    self.handle = None;
                    self.state = IngestState::Stopped;
                    self.signalled = true;
                    return match code {
                        Some(code) if code != 0 && !self.stopping => {
                            log::error!("[{}] Transcoder exited with code {}", self.session_id, code);
                            IngestSignal::Failed(UNEXPECTED_EXIT.to_string())
                        }
                        _ => {
                            log::info!("[{}] Transcoder finished ({:?})", self.session_id, code);
                            IngestSignal::Ended
                        }
                    };
                }
                Wake::Event(None) => {
                    self.handle = None;
                    if self.stopping {
                        self.state = IngestState::Stopped;
                        self.signalled = true;
                        return IngestSignal::Ended;
                    }
                    log::error!("[{}] Transcoder vanished without exit status", self.session_id);
                    return self.fail(UNEXPECTED_EXIT);
                }
            }
        }
    }

    /// Producer went away: flush what can be flushed, close input, stop the
    /// transcoder within the grace period and wait for it to exit.
    pub async fn on_disconnect(&mut self) {
        self.stopping = true;
        let grace = self.settings.shutdown_grace;

        if !self.pending.is_empty() {
            let deadline = Instant::now() + grace;
            if let Err(e) = self.drain_until(0, deadline).await {
                log::warn!(
                    "[{}] Dropping {} queued bytes at disconnect: {}",
                    self.session_id,
                    self.pending_bytes,
                    e
                );
            }
        }
        self.pending.clear();
        self.pending_bytes = 0;

        if let Some(mut handle) = self.handle.take() {
            handle.close_input();
            handle.request_stop(grace);

            let waited = tokio::time::timeout(grace + EXIT_WAIT_MARGIN, async {
                loop {
                    match handle.next_event().await {
                        Some(TranscoderEvent::Exited { code }) => return code,
                        Some(_) => continue,
                        None => return None,
                    }
                }
            })
            .await;
            match waited {
                Ok(code) => log::info!("[{}] Ingest stopped ({:?})", self.session_id, code),
                Err(_) => log::warn!("[{}] Transcoder exit not observed", self.session_id),
            }
        }
        self.state = IngestState::Stopped;
    }

    async fn launch(&mut self) -> Result<(), IngestError> {
        self.state = IngestState::Starting;

        let output_dir = self.settings.output_dir(&self.session_id);
        if let Err(e) = tokio::fs::create_dir_all(&output_dir).await {
            log::error!("[{}] Cannot create {}: {}", self.session_id, output_dir.display(), e);
            self.state = IngestState::Stopped;
            return Err(IngestError::OutputDir(e));
        }

        let config = TranscodeConfig {
            output_dir,
            hw_accel: self.settings.hw_accel.unwrap_or_else(HwAccel::detect),
            segment_seconds: self.settings.segment_seconds,
            playlist_size: self.settings.playlist_size,
            session_label: self.session_id.to_string(),
        };
        match self.transcoder.start(config).await {
            Ok(handle) => {
                self.handle = Some(handle);
                self.state = IngestState::Running;
                log::info!("[{}] Ingest running", self.session_id);
                Ok(())
            }
            Err(e) => {
                log::error!("[{}] {}", self.session_id, e);
                self.state = IngestState::Stopped;
                Err(e.into())
            }
        }
    }

    /// Push queued chunks until the transcoder pushes back
    fn flush(&mut self) -> Result<(), IngestError> {
        let Some(handle) = &self.handle else {
            return Err(IngestError::InputClosed);
        };
        while let Some(chunk) = self.pending.pop_front() {
            let len = chunk.len();
            match handle.write(chunk) {
                WriteOutcome::Accepted => self.pending_bytes -= len,
                WriteOutcome::Backpressure(chunk) => {
                    self.pending.push_front(chunk);
                    break;
                }
                WriteOutcome::Closed(chunk) => {
                    self.pending.push_front(chunk);
                    return Err(IngestError::InputClosed);
                }
            }
        }
        Ok(())
    }

    /// Wait for capacity until at most `target` bytes remain queued
    async fn drain_until(&mut self, target: usize, deadline: Instant) -> Result<(), IngestError> {
        while !self.pending.is_empty() && self.pending_bytes > target {
            let sender = self
                .handle
                .as_ref()
                .and_then(TranscodeHandle::input_sender)
                .ok_or(IngestError::InputClosed)?;
            let permit = match tokio::time::timeout_at(deadline, sender.reserve_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(IngestError::InputClosed),
                Err(_) => return Err(IngestError::Stalled(self.settings.write_timeout)),
            };
            if let Some(chunk) = self.pending.pop_front() {
                self.pending_bytes -= chunk.len();
                permit.send(chunk);
            }
            self.flush()?;
        }
        Ok(())
    }

    /// A closed input usually means the transcoder died; report its exit
    /// code instead when it arrives shortly.
    async fn explain_closed_input(&mut self, err: IngestError) -> IngestError {
        if !matches!(err, IngestError::InputClosed) {
            return err;
        }
        let Some(handle) = self.handle.as_mut() else {
            return err;
        };
        let exit = tokio::time::timeout(CLOSED_INPUT_EXIT_WAIT, async {
            loop {
                match handle.next_event().await {
                    Some(TranscoderEvent::Exited { code }) => return code,
                    Some(_) => continue,
                    None => return None,
                }
            }
        })
        .await;
        match exit {
            Ok(Some(code)) if code != 0 => {
                log::error!("[{}] Transcoder exited with code {}", self.session_id, code);
                IngestError::Exited(code)
            }
            _ => err,
        }
    }

    /// Stop after a failure: no relaunch, transcoder asked to exit
    fn abort(&mut self) {
        self.state = IngestState::Stopped;
        self.signalled = true;
        if let Some(handle) = self.handle.as_mut() {
            handle.close_input();
            handle.request_stop(self.settings.shutdown_grace);
        }
    }

    fn fail(&mut self, reason: &str) -> IngestSignal {
        self.abort();
        IngestSignal::Failed(reason.to_string())
    }
}

impl Drop for IngestPipeline {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            handle.request_stop(Duration::ZERO);
        }
    }
}
