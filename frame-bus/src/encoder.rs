use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use futures::{FutureExt as _, future::BoxFuture};
use tokio::{
    io::{AsyncBufReadExt as _, BufReader},
    process::{Child, ChildStderr, Command},
};
use tokio_util::task::TaskTracker;

use crate::{
    error::{RelayError, RelayResult},
    frame::FrameGeometry,
    sink::{SinkMonitor, SinkOpener, SinkWriter},
};

/// Colour description tags written into the output stream (ffmpeg enum values).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorMetadata {
    pub primaries: u32,
    pub transfer: u32,
    pub matrix: u32,
}

impl ColorMetadata {
    /// BT.2020 primaries, SMPTE ST 2084 (PQ) transfer, BT.2020 non-constant luminance.
    pub const BT2020_PQ: Self = Self {
        primaries: 9,
        transfer: 16,
        matrix: 9,
    };
}

/// ffmpeg invocation for one session: raw frames on stdin, ProRes 4444 XQ out.
#[derive(Clone, Debug)]
pub struct EncoderConfig {
    pub program: String,
    pub geometry: FrameGeometry,
    pub fps: u32,
    pub output: PathBuf,
    pub overwrite: bool,
    pub color: Option<ColorMetadata>,
    // "error", "warning", ...; None keeps ffmpeg's default
    pub loglevel: Option<String>,
}

impl EncoderConfig {
    pub fn new(geometry: FrameGeometry, output: impl Into<PathBuf>) -> Self {
        Self {
            program: "ffmpeg".to_string(),
            geometry,
            fps: 30,
            output: output.into(),
            overwrite: true,
            color: Some(ColorMetadata::BT2020_PQ),
            loglevel: None,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    /// Command line arguments writing to `output`.
    pub fn args(&self, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        args.push(if self.overwrite { "-y" } else { "-n" }.to_string());
        if let Some(level) = &self.loglevel {
            args.extend(["-loglevel".to_string(), level.clone()]);
        }

        let format = self.geometry.format;
        let size = format!("{}x{}", self.geometry.width, self.geometry.height);
        let fps = self.fps.to_string();
        let input: [&str; 10] = [
            "-f",
            "rawvideo",
            "-pix_fmt",
            format.sink_pix_fmt(),
            "-s:v",
            &size,
            "-r",
            &fps,
            "-i",
            "-",
        ];
        args.extend(input.map(String::from));

        if format.is_hdr() {
            // planar float has no alpha; ProRes 4444 wants 10-bit 4:4:4
            args.extend(["-vf", "format=yuva444p10le"].map(String::from));
        }
        args.extend(["-c:v", "prores_ks", "-profile:v", "4"].map(String::from));
        if !format.is_hdr() {
            args.extend(["-pix_fmt", "yuva444p"].map(String::from));
        }

        if let Some(color) = self.color {
            args.extend([
                "-color_primaries".to_string(),
                color.primaries.to_string(),
                "-color_trc".to_string(),
                color.transfer.to_string(),
                "-colorspace".to_string(),
                color.matrix.to_string(),
            ]);
        }

        args.push(output.to_string_lossy().into_owned());
        args
    }

    /// Session 1 writes to `output`, later sessions to `<stem>-<seq>.<ext>`.
    pub fn output_for_session(&self, seq: u64) -> PathBuf {
        if seq <= 1 {
            return self.output.clone();
        }
        let stem = self
            .output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let name = match self.output.extension() {
            Some(ext) => format!("{}-{}.{}", stem, seq, ext.to_string_lossy()),
            None => format!("{}-{}", stem, seq),
        };
        self.output.with_file_name(name)
    }
}

/// Starts one ffmpeg process per session and wires its stdin to a [`SinkWriter`].
pub struct FfmpegLauncher {
    config: EncoderConfig,
    queue_depth: usize,
    tracker: TaskTracker,
}

impl FfmpegLauncher {
    pub fn new(config: EncoderConfig, queue_depth: usize) -> Self {
        Self {
            config,
            queue_depth,
            tracker: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub async fn spawn(&self, seq: u64) -> RelayResult<SinkWriter> {
        spawn_encoder(&self.config, self.queue_depth, &self.tracker, seq).await
    }

    /// Waits for every encoder started so far to exit. Returns `false` on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }
}

impl SinkOpener for FfmpegLauncher {
    fn open(&self, seq: u64) -> BoxFuture<'static, RelayResult<SinkWriter>> {
        let config = self.config.clone();
        let queue_depth = self.queue_depth;
        let tracker = self.tracker.clone();
        async move { spawn_encoder(&config, queue_depth, &tracker, seq).await }.boxed()
    }
}

async fn spawn_encoder(
    config: &EncoderConfig,
    queue_depth: usize,
    tracker: &TaskTracker,
    seq: u64,
) -> RelayResult<SinkWriter> {
    let output = config.output_for_session(seq);
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            RelayError::sink_unavailable(format!(
                "failed to create output directory '{}': {}",
                parent.display(),
                e
            ))
        })?;
    }

    let mut cmd = Command::new(&config.program);
    cmd.args(config.args(&output))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        RelayError::sink_unavailable(format!(
            "failed to spawn {} (is it installed and on PATH?): {}",
            config.program, e
        ))
    })?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| RelayError::sink_unavailable("failed to open encoder stdin"))?;

    log::info!(
        "encoder: started {} (pid {:?}) for session {}, {} -> {}",
        config.program,
        child.id(),
        seq,
        config.geometry,
        output.display()
    );

    let sink = SinkWriter::spawn(stdin, queue_depth);
    if let Some(stderr) = child.stderr.take() {
        tracker.spawn(forward_stderr(stderr, seq));
    }
    tracker.spawn(watch_exit(child, sink.monitor(), seq));
    Ok(sink)
}

async fn forward_stderr(stderr: ChildStderr, seq: u64) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if !line.is_empty() {
                    log::info!(target: "ffmpeg", "[session {}] {}", seq, line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!(target: "ffmpeg", "[session {}] stderr read failed: {}", seq, e);
                break;
            }
        }
    }
}

async fn watch_exit(mut child: Child, monitor: SinkMonitor, seq: u64) {
    match child.wait().await {
        Ok(status) if monitor.is_closed() => {
            if status.success() {
                log::info!("encoder: session {} finished ({})", seq, status);
            } else {
                log::warn!("encoder: session {} exited with {}", seq, status);
            }
        }
        Ok(status) => {
            log::error!("encoder: session {} exited unexpectedly ({})", seq, status);
            monitor.fail(RelayError::sink_unavailable(format!(
                "encoder exited unexpectedly ({status})"
            )));
        }
        Err(e) => {
            log::error!("encoder: waiting on session {} failed: {}", seq, e);
            monitor.fail(RelayError::sink_unavailable(format!(
                "failed to wait for encoder: {e}"
            )));
        }
    }
}
