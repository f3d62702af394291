use crate::combine;
use crate::config::{DecodeConfig, EncodeConfig, GapPolicy};
use crate::decoder;
use crate::encoder::{self, EncodeReport};
use crate::frame::{self, FrameRef};
use crate::manifest::{self, Manifest, MANIFEST_VERSION};
use crate::plan::ChunkPlan;
use crate::progress::{DecodeSummary, EncodeSummary, ProgressConfig, ProgressHandle, ProgressReporter};
use crate::transport::VideoTransport;

use anyhow::{bail, Context, Result};
use filetime::FileTime;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Source file -> numbered frames -> video (+ manifest sidecar).
pub fn encode_file(
    input: &Path,
    video: &Path,
    cfg: &EncodeConfig,
    transport: &dyn VideoTransport,
    progress_cfg: ProgressConfig,
) -> Result<EncodeSummary> {
    run_encode(input, video, cfg, transport, progress_cfg, || File::open(input))
}

fn run_encode<R, F>(
    input: &Path,
    video: &Path,
    cfg: &EncodeConfig,
    transport: &dyn VideoTransport,
    progress_cfg: ProgressConfig,
    open_source: F,
) -> Result<EncodeSummary>
where
    R: Read + Seek,
    F: Fn() -> std::io::Result<R> + Sync,
{
    cfg.validate()?;
    let meta = std::fs::metadata(input).with_context(|| format!("stat {}", input.display()))?;
    if !meta.is_file() {
        bail!("input must be a regular file: {}", input.display());
    }
    let plan = ChunkPlan::new(meta.len(), cfg.geometry.buffer_size())?;
    let work = scoped_work_dir(cfg.work_root.as_deref(), "bytereel-enc-")?;

    let reporter = ProgressReporter::new("encode", plan.file_size, progress_cfg);
    let progress = reporter.handle();
    progress.log(format!(
        "Encode plan: source={} bytes={} frame={}x{} chunks={} padding={} workers={} gap_policy={} work_dir={}",
        input.display(),
        plan.file_size,
        cfg.geometry.width,
        cfg.geometry.height,
        plan.chunk_count,
        plan.padding_bytes(),
        cfg.workers,
        cfg.gap_policy.name(),
        work.path().display(),
    ));

    progress.set_stage("encode frames");
    let report = encoder::encode_chunks(&plan, cfg.geometry, cfg.workers, work.path(), open_source, &progress)?;
    let failed_chunks = report.failed_indices();
    progress.log(format!(
        "Encoded {} of {} chunks ({} bytes read)",
        report.frames.len(),
        plan.chunk_count,
        report.bytes_read
    ));
    let frames = sequence_frames(report, cfg, work.path(), &progress);

    progress.set_stage(format!("mux {} frames", frames.len()));
    if let Some(parent) = video.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let muxed = match transport.mux(&frames, video, cfg.fps) {
        Ok(()) => true,
        Err(err) => {
            progress.warning(format!("mux failed, continuing without a video: {}", err));
            false
        }
    };

    let mut manifest_path = None;
    if muxed {
        progress.set_stage("write manifest");
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            source_name: input
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default(),
            source_len: plan.file_size,
            source_crc32: manifest::file_crc32(input, None)?,
            source_mtime_unix: manifest::mtime_unix(input),
            resolution: cfg.resolution.map(|r| r.name().to_string()),
            width: cfg.geometry.width,
            height: cfg.geometry.height,
            buffer_size: plan.buffer_size as u64,
            chunk_count: plan.chunk_count as u64,
            fps: cfg.fps,
            gap_policy: cfg.gap_policy,
            failed_chunks: failed_chunks.clone(),
        };
        let path = manifest::sidecar_path(video);
        match manifest.write(&path) {
            Ok(()) => manifest_path = Some(path),
            Err(err) => progress.warning(format!("manifest not written: {:#}", err)),
        }
    }

    release_work_dir(work, cfg.keep_work_dir, &progress);
    let outcome = reporter.finish(format!("encoded {} frames into {}", frames.len(), video.display()));
    Ok(EncodeSummary {
        input: input.to_path_buf(),
        video: video.to_path_buf(),
        manifest: manifest_path,
        width: cfg.geometry.width,
        height: cfg.geometry.height,
        source_bytes: plan.file_size,
        processed_bytes: outcome.processed_bytes,
        chunk_count: plan.chunk_count,
        frames_written: frames.len(),
        failed_chunks,
        gap_policy: cfg.gap_policy.name().to_string(),
        workers: cfg.workers,
        muxed,
        elapsed: outcome.elapsed,
        avg_bytes_per_sec: outcome.avg_bytes_per_sec,
        warning_count: outcome.warning_count,
        warnings: outcome.warnings,
    })
}

/// Ordered frame list handed to the muxer. Under `ZeroFill` every failed
/// chunk gets an all-zero frame so later frames keep their position.
fn sequence_frames(
    report: EncodeReport,
    cfg: &EncodeConfig,
    frame_dir: &Path,
    progress: &ProgressHandle,
) -> Vec<FrameRef> {
    let mut frames = report.frames;
    if report.failures.is_empty() {
        return frames;
    }

    match cfg.gap_policy {
        GapPolicy::Skip => {
            progress.warning(format!(
                "{} chunk(s) missing from the video, later bytes will shift: {:?}",
                report.failures.len(),
                report.failures.iter().map(|f| f.index).collect::<Vec<_>>()
            ));
        }
        GapPolicy::ZeroFill => {
            let blank = frame::encode_chunk(&[], cfg.geometry);
            for failure in &report.failures {
                let path = frame_dir.join(frame::frame_file_name(failure.index));
                match frame::write_frame(&path, &blank) {
                    Ok(()) => {
                        progress.warning(format!("chunk {} replaced by a zero frame", failure.index));
                        frames.push(FrameRef {
                            index: failure.index,
                            path,
                        });
                    }
                    Err(err) => progress.warning(format!(
                        "chunk {} could not be zero-filled and will shift later bytes: {}",
                        failure.index, err
                    )),
                }
            }
            frames.sort_by_key(|f| f.index);
        }
    }
    frames
}

/// Video -> numbered frames -> per-worker segments -> recovered file.
pub fn decode_video(
    video: &Path,
    output: &Path,
    cfg: &DecodeConfig,
    transport: &dyn VideoTransport,
    progress_cfg: ProgressConfig,
) -> Result<DecodeSummary> {
    cfg.validate()?;

    let reporter = ProgressReporter::new("decode", 0, progress_cfg);
    let progress = reporter.handle();

    let manifest = load_manifest(video, &progress);
    let mut geometry = cfg.geometry;
    let mut fps = cfg.fps;
    if let Some(m) = &manifest {
        if m.geometry() != geometry {
            progress.warning(format!(
                "manifest says {}x{} frames, using that instead of {}x{}",
                m.width, m.height, geometry.width, geometry.height
            ));
            geometry = m.geometry();
        }
        if m.fps != fps && m.fps > 0 {
            progress.warning(format!("manifest says {} fps, using that instead of {}", m.fps, fps));
            fps = m.fps;
        }
        if !m.failed_chunks.is_empty() {
            progress.warning(format!(
                "encoder reported failed chunks {:?} (policy={})",
                m.failed_chunks,
                m.gap_policy.name()
            ));
        }
    }
    let buffer_size = geometry.buffer_size();

    let work = scoped_work_dir(cfg.work_root.as_deref(), "bytereel-dec-")?;
    let frame_dir = work.path().join("frames");
    let segment_dir = work.path().join("segments");
    std::fs::create_dir_all(&frame_dir)?;
    std::fs::create_dir_all(&segment_dir)?;
    progress.log(format!(
        "Decode plan: video={} frame={}x{} fps={} workers={} gap_policy={} work_dir={}",
        video.display(),
        geometry.width,
        geometry.height,
        fps,
        cfg.workers,
        cfg.gap_policy.name(),
        work.path().display(),
    ));

    progress.set_stage("demux");
    if let Err(err) = transport.demux(video, &frame_dir, fps) {
        progress.warning(format!("demux failed, decoding whatever frames exist: {}", err));
    }

    let (frames, rejected) = frame::list_frames(&frame_dir, transport.demux_prefix())?;
    for path in &rejected {
        progress.warning(format!("excluded frame with unparseable name: {}", path.display()));
    }
    progress.set_total_bytes(2 * (frames.len() as u64) * (buffer_size as u64));

    progress.set_stage(format!("decode {} frames", frames.len()));
    let segments = decoder::decode_frames(&frames, geometry, cfg.workers, &segment_dir, cfg.gap_policy, &progress)?;

    progress.set_stage("combine segments");
    let combined = combine::combine_segments(&segments, output, cfg.gap_policy, buffer_size, &progress)?;

    for seg in &segments {
        progress.log(format!(
            "segment {}: {}/{} frames, {} bytes",
            seg.worker_id, seg.written_frames, seg.expected_frames, seg.bytes_written
        ));
    }

    let mut failed_frames = segments
        .iter()
        .flat_map(|s| s.failures.iter().map(|f| f.index))
        .collect::<Vec<_>>();
    failed_frames.sort_unstable();

    let mut recovered_bytes = combined.bytes_written;
    let mut padding_bytes = None;
    let mut crc_match = None;
    let mut trimmed = false;

    if let Some(m) = &manifest {
        padding_bytes = recovered_bytes.checked_sub(m.source_len);
        crc_match = Some(
            recovered_bytes >= m.source_len
                && manifest::file_crc32(output, Some(m.source_len))? == m.source_crc32,
        );
        if crc_match == Some(false) {
            progress.warning("recovered bytes do not match the source checksum");
        }
    }

    if cfg.trim {
        let gaps = !failed_frames.is_empty() || !combined.missing_segments.is_empty();
        let lossy = cfg.gap_policy == GapPolicy::Skip && gaps;
        match &manifest {
            None => progress.warning("--trim needs a manifest sidecar; padding kept"),
            Some(m) if !m.length_is_reliable() || lossy => {
                progress.warning("gaps shifted the recovered bytes; padding kept")
            }
            Some(m) if recovered_bytes != m.chunk_count * m.buffer_size => progress.warning(format!(
                "recovered {} bytes but {} frames of {} were encoded; padding kept",
                recovered_bytes, m.chunk_count, m.buffer_size
            )),
            Some(m) if crc_match == Some(false) && !zero_filled_gaps(m, cfg.gap_policy, gaps) => {
                progress.warning("checksum mismatch is not explained by zero-filled gaps; padding kept")
            }
            Some(m) => {
                let f = OpenOptions::new()
                    .write(true)
                    .open(output)
                    .with_context(|| format!("open {} for trim", output.display()))?;
                f.set_len(m.source_len)?;
                recovered_bytes = m.source_len;
                trimmed = true;
            }
        }
    }

    if let Some(mtime) = manifest.as_ref().and_then(|m| m.source_mtime_unix) {
        let _ = filetime::set_file_mtime(output, FileTime::from_unix_time(mtime, 0));
    }

    release_work_dir(work, cfg.keep_work_dir, &progress);
    let outcome = reporter.finish(format!("recovered {} bytes into {}", recovered_bytes, output.display()));
    Ok(DecodeSummary {
        video: video.to_path_buf(),
        output: output.to_path_buf(),
        frame_count: frames.len(),
        rejected_frames: rejected.len(),
        failed_frames,
        missing_segments: combined.missing_segments,
        recovered_bytes,
        padding_bytes: if trimmed { Some(0) } else { padding_bytes },
        crc_match,
        trimmed,
        gap_policy: cfg.gap_policy.name().to_string(),
        workers: cfg.workers,
        elapsed: outcome.elapsed,
        avg_bytes_per_sec: outcome.avg_bytes_per_sec,
        warning_count: outcome.warning_count,
        warnings: outcome.warnings,
    })
}

/// Zero-filled chunks or frames change the checksum without moving any byte.
fn zero_filled_gaps(m: &Manifest, policy: GapPolicy, decode_gaps: bool) -> bool {
    let encode_gaps = m.gap_policy == GapPolicy::ZeroFill && !m.failed_chunks.is_empty();
    let decode_gaps = policy == GapPolicy::ZeroFill && decode_gaps;
    encode_gaps || decode_gaps
}

fn load_manifest(video: &Path, progress: &ProgressHandle) -> Option<Manifest> {
    let path = manifest::sidecar_path(video);
    if !path.is_file() {
        progress.log("no manifest sidecar; recovered file keeps its frame padding");
        return None;
    }
    match Manifest::read(&path) {
        Ok(m) => {
            progress.log(format!(
                "Manifest: source={} bytes={} chunks={} frame={}x{}",
                m.source_name, m.source_len, m.chunk_count, m.width, m.height
            ));
            Some(m)
        }
        Err(err) => {
            progress.warning(format!("ignoring unreadable manifest: {:#}", err));
            None
        }
    }
}

/// Removed on drop; see `release_work_dir`.
fn scoped_work_dir(root: Option<&Path>, prefix: &str) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix);
    let dir = match root {
        Some(root) => {
            std::fs::create_dir_all(root)?;
            builder.tempdir_in(root)
        }
        None => builder.tempdir(),
    };
    dir.context("create working directory")
}

fn release_work_dir(work: TempDir, keep: bool, progress: &ProgressHandle) {
    if keep {
        let kept = work.keep();
        progress.log(format!("working directory kept at {}", kept.display()));
    }
}

/// Where `roundtrip` puts its intermediate files.
pub fn roundtrip_paths(temp_dir: &Path, input: &Path) -> (PathBuf, PathBuf) {
    let name = input
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "input".to_string());
    (
        temp_dir.join(format!("{}.mkv", name)),
        temp_dir.join(format!("{}.recovered", name)),
    )
}
