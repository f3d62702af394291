use crate::error::{IoStage, PipelineError};
use crate::frame::{FrameRef, DEMUX_PREFIX};

use anyhow::{bail, Context};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;

const STDERR_TAIL_LINES: usize = 20;

/// Packs numbered frames into a video and unpacks them again.
pub trait VideoTransport {
    /// Writes `frames`, in slice order, as consecutive video frames at `fps`.
    fn mux(&self, frames: &[FrameRef], video: &Path, fps: u32) -> Result<(), PipelineError>;

    /// Regenerates `<frame_dir>/<demux_prefix()><n>.png` for n = 1, 2, ...
    /// `fps` must be the rate the video was muxed at, or frames get dropped
    /// or repeated.
    fn demux(&self, video: &Path, frame_dir: &Path, fps: u32) -> Result<(), PipelineError>;

    fn demux_prefix(&self) -> &str {
        DEMUX_PREFIX
    }
}

/// Lossless FFV1-in-Matroska through an `ffmpeg` subprocess.
#[derive(Debug, Clone)]
pub struct FfmpegTransport {
    pub threads: usize,
}

impl FfmpegTransport {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }
}

impl VideoTransport for FfmpegTransport {
    fn mux(&self, frames: &[FrameRef], video: &Path, fps: u32) -> Result<(), PipelineError> {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel").arg("error")
            .arg("-y")
            .arg("-f").arg("image2pipe")
            .arg("-framerate").arg(fps.to_string())
            .arg("-c:v").arg("png")
            .arg("-i").arg("pipe:0")
            .arg("-c:v").arg("ffv1")
            .arg("-level").arg("3")
            .arg("-threads").arg(self.threads.to_string())
            .arg("-pix_fmt").arg("gray")
            .arg("-f").arg("matroska")
            .arg(video)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| PipelineError::io(IoStage::Open, "ffmpeg (mux)", e))?;
        let stderr_handle = child.stderr.take().map(spawn_stderr_collector);

        let mut feed_error = None;
        if let Some(stdin) = child.stdin.take() {
            let mut wtr = BufWriter::with_capacity(8 * 1024 * 1024, stdin);
            for f in frames {
                let bytes = match std::fs::read(&f.path) {
                    Ok(b) => b,
                    Err(e) => {
                        feed_error = Some(PipelineError::io(IoStage::Read, f.path.display(), e));
                        break;
                    }
                };
                // A write error means ffmpeg went away; its exit status says why.
                if wtr.write_all(&bytes).is_err() {
                    break;
                }
            }
            let _ = wtr.flush();
        }

        if feed_error.is_some() {
            let _ = child.kill();
        }
        let status = child
            .wait()
            .map_err(|e| PipelineError::io(IoStage::Write, video.display(), e))?;
        let stderr_lines = stderr_handle
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if let Some(err) = feed_error {
            return Err(err);
        }
        check_status("ffmpeg (mux)", status, stderr_lines)
    }

    fn demux(&self, video: &Path, frame_dir: &Path, fps: u32) -> Result<(), PipelineError> {
        let pattern = frame_dir.join(format!("{}%d.png", self.demux_prefix()));
        let out = Command::new("ffmpeg")
            .arg("-hide_banner")
            .arg("-loglevel").arg("error")
            .arg("-i").arg(video)
            .arg("-vf").arg(format!("fps={}", fps))
            .arg("-pix_fmt").arg("gray")
            .arg(&pattern)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| PipelineError::io(IoStage::Open, "ffmpeg (demux)", e))?;

        let text = String::from_utf8_lossy(&out.stderr);
        let lines = tail_lines(text.lines().map(str::to_string));
        check_status("ffmpeg (demux)", out.status, lines)
    }
}

pub fn ensure_ffmpeg_available() -> anyhow::Result<()> {
    let out = Command::new("ffmpeg")
        .arg("-version")
        .output()
        .context("failed to run ffmpeg -version")?;
    if !out.status.success() {
        bail!("ffmpeg exists but returned non-zero on -version");
    }
    Ok(())
}

fn check_status(
    program: &str,
    status: std::process::ExitStatus,
    stderr_lines: Vec<String>,
) -> Result<(), PipelineError> {
    if status.success() {
        return Ok(());
    }
    let stderr_tail = if stderr_lines.is_empty() {
        "<no ffmpeg stderr>".to_string()
    } else {
        stderr_lines.join(" | ")
    };
    Err(PipelineError::ExternalProcess {
        program: program.to_string(),
        status: status.to_string(),
        stderr_tail,
    })
}

fn tail_lines(lines: impl Iterator<Item = String>) -> Vec<String> {
    let mut tail = VecDeque::new();
    for line in lines {
        let cleaned = line.trim().to_string();
        if cleaned.is_empty() {
            continue;
        }
        tail.push_back(cleaned);
        if tail.len() > STDERR_TAIL_LINES {
            tail.pop_front();
        }
    }
    tail.into_iter().collect()
}

fn spawn_stderr_collector(stderr: impl Read + Send + 'static) -> JoinHandle<Vec<String>> {
    std::thread::spawn(move || {
        let reader = BufReader::new(stderr);
        tail_lines(reader.lines().map_while(Result::ok))
    })
}
