//! ffmpeg subprocess transcoder
//!
//! Runs one `ffmpeg` process per session, feeding media into its stdin and
//! letting the HLS muxer write fMP4 segments into the session directory.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::mpsc;

use super::hwaccel::{HwAccel, VAAPI_DEVICE};
use super::transcoder::{
    TranscodeConfig, TranscodeHandle, Transcoder, TranscoderEnd, TranscoderError, TranscoderEvent,
};

/// Default number of chunks buffered between the pipeline and ffmpeg's stdin
pub const DEFAULT_INPUT_CAPACITY: usize = 64;

/// Grace used when the pipeline drops its handle without a stop request
const ABANDONED_GRACE: Duration = Duration::from_secs(1);

pub const PLAYLIST_FILE: &str = "playlist.m3u8";
pub const INIT_SEGMENT_FILE: &str = "init.mp4";
pub const SEGMENT_PATTERN: &str = "segment%d.m4s";

/// Transcoder backed by an ffmpeg executable
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: String,
    input_capacity: usize,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<String>) -> Self {
        FfmpegTranscoder {
            program: program.into(),
            input_capacity: DEFAULT_INPUT_CAPACITY,
        }
    }

    pub fn with_input_capacity(mut self, capacity: usize) -> Self {
        self.input_capacity = capacity.max(1);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

/// Build the ffmpeg argument list for a run
pub fn ffmpeg_args(config: &TranscodeConfig) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let mut push = |values: &[&str]| args.extend(values.iter().map(|v| v.to_string()));

    if config.hw_accel == HwAccel::Vaapi {
        push(&["-vaapi_device", VAAPI_DEVICE]);
    }
    push(&["-i", "pipe:0"]);
    if config.hw_accel == HwAccel::Vaapi {
        push(&["-vf", "format=nv12,hwupload"]);
    }

    push(&[
        "-c:v",
        config.hw_accel.encoder(),
        "-preset",
        "ultrafast",
        "-tune",
        "zerolatency",
        "-crf",
        "30",
        "-g",
        "240",
        "-keyint_min",
        "240",
        "-sc_threshold",
        "0",
        "-b:v",
        "50k",
        "-maxrate",
        "600k",
        "-bufsize",
        "800k",
        "-c:a",
        "aac",
        "-b:a",
        "64k",
        "-ar",
        "44100",
        "-f",
        "hls",
    ]);

    let segment_seconds = config.segment_seconds.to_string();
    let playlist_size = config.playlist_size.to_string();
    push(&[
        "-hls_time",
        &segment_seconds,
        "-hls_list_size",
        &playlist_size,
        "-hls_flags",
        "delete_segments+omit_endlist+append_list+discont_start+temp_file",
        "-hls_segment_type",
        "fmp4",
        "-hls_fmp4_init_filename",
        INIT_SEGMENT_FILE,
    ]);

    let segment_path = output_path(&config.output_dir, SEGMENT_PATTERN);
    let playlist_path = output_path(&config.output_dir, PLAYLIST_FILE);
    push(&["-hls_segment_filename", &segment_path, &playlist_path]);

    args
}

fn output_path(dir: &Path, file: &str) -> String {
    dir.join(file).to_string_lossy().into_owned()
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn start(&self, config: TranscodeConfig) -> Result<TranscodeHandle, TranscoderError> {
        let args = ffmpeg_args(&config);
        log::debug!("[{}] {} {}", config.session_label, self.program, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscoderError::Launch {
                program: self.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(TranscoderError::MissingStdin)?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, config.session_label.clone()));
        }

        log::info!(
            "[{}] Transcoder started (pid {:?}, encoder {})",
            config.session_label,
            child.id(),
            config.hw_accel.encoder()
        );

        let (handle, end) = TranscodeHandle::channel(self.input_capacity);
        tokio::spawn(supervise(child, stdin, end, config.session_label));
        Ok(handle)
    }
}

/// Forward ffmpeg's diagnostic output to the debug log
async fn forward_stderr(stderr: ChildStderr, label: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => log::debug!("[{}] ffmpeg: {}", label, line),
            Ok(None) => break,
            Err(e) => {
                log::debug!("[{}] ffmpeg stderr closed: {}", label, e);
                break;
            }
        }
    }
}

/// Copy queued chunks into stdin until the input channel ends
async fn pump_input(
    mut stdin: ChildStdin,
    mut input: mpsc::Receiver<Bytes>,
    events: mpsc::UnboundedSender<TranscoderEvent>,
    label: String,
) {
    while let Some(chunk) = input.recv().await {
        if let Err(e) = stdin.write_all(&chunk).await {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                // Process is exiting; the exit event reports the outcome.
                log::debug!("[{}] Transcoder stdin closed", label);
            } else {
                log::error!("[{}] Failed to write to transcoder: {}", label, e);
                let _ = events.send(TranscoderEvent::Errored(e.to_string()));
            }
            return;
        }
    }
    if let Err(e) = stdin.shutdown().await {
        log::debug!("[{}] Failed to close transcoder stdin: {}", label, e);
    }
}

/// Own the child process until it exits, reporting lifecycle events
async fn supervise(mut child: Child, stdin: ChildStdin, end: TranscoderEnd, label: String) {
    let TranscoderEnd {
        input,
        events,
        mut stop,
    } = end;

    let _ = events.send(TranscoderEvent::Started);
    let pump = tokio::spawn(pump_input(stdin, input, events.clone(), label.clone()));

    let status = tokio::select! {
        status = child.wait() => status,
        request = &mut stop => {
            let grace = request.unwrap_or(ABANDONED_GRACE);
            terminate(&mut child, grace, &label).await
        }
    };
    pump.abort();

    match status {
        Ok(status) => {
            log::info!("[{}] Transcoder exited: {}", label, status);
            let _ = events.send(TranscoderEvent::Exited {
                code: status.code(),
            });
        }
        Err(e) => {
            log::error!("[{}] Failed to wait for transcoder: {}", label, e);
            let _ = events.send(TranscoderEvent::Errored(e.to_string()));
        }
    }
}

/// Interrupt the process, escalating to a kill after `grace`
async fn terminate(child: &mut Child, grace: Duration, label: &str) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            log::debug!("[{}] Failed to interrupt transcoder: {}", label, e);
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            log::warn!(
                "[{}] Transcoder did not stop within {:?}, killing",
                label,
                grace
            );
            child.kill().await?;
            child.wait().await
        }
    }
}
