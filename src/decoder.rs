use crate::config::{Geometry, GapPolicy};
use crate::error::{ChunkFailure, IoStage, PipelineError};
use crate::frame::{self, FrameRef};
use crate::plan::split_slices;
use crate::progress::ProgressHandle;

use anyhow::{bail, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;

pub const SEGMENT_PREFIX: &str = "segment_";

/// What one decode worker left behind in its segment file.
#[derive(Debug, Clone)]
pub struct SegmentReport {
    /// 1-based; segments are combined in this order.
    pub worker_id: usize,
    pub path: PathBuf,
    pub expected_frames: usize,
    pub written_frames: usize,
    pub bytes_written: u64,
    pub failures: Vec<ChunkFailure>,
}

pub fn segment_path(dir: &Path, worker_id: usize) -> PathBuf {
    dir.join(format!("{}{}", SEGMENT_PREFIX, worker_id))
}

/// `frames` must already be ordered by index.
pub fn decode_frames(
    frames: &[FrameRef],
    geometry: Geometry,
    workers: usize,
    segment_dir: &Path,
    policy: GapPolicy,
    progress: &ProgressHandle,
) -> Result<Vec<SegmentReport>> {
    if workers == 0 {
        return Err(PipelineError::InvalidConfig("worker count must be positive".to_string()).into());
    }

    let slices = split_slices(frames.len(), workers);
    let results = thread::scope(|s| {
        let handles = slices
            .into_iter()
            .enumerate()
            .map(|(i, range)| {
                let worker_id = i + 1;
                let slice = &frames[range];
                let path = segment_path(segment_dir, worker_id);
                s.spawn(move || decode_worker(worker_id, slice, path, geometry, policy, progress))
            })
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .enumerate()
            .map(|(i, h)| h.join().map_err(|_| i + 1))
            .collect::<Vec<_>>()
    });

    let mut reports = Vec::with_capacity(results.len());
    for r in results {
        match r {
            Ok(report) => reports.push(report),
            Err(worker_id) => bail!("decode worker {} panicked", worker_id),
        }
    }
    Ok(reports)
}

fn decode_worker(
    worker_id: usize,
    frames: &[FrameRef],
    path: PathBuf,
    geometry: Geometry,
    policy: GapPolicy,
    progress: &ProgressHandle,
) -> SegmentReport {
    let op_id = format!("dec{:02}", worker_id);
    let mut report = SegmentReport {
        worker_id,
        path,
        expected_frames: frames.len(),
        written_frames: 0,
        bytes_written: 0,
        failures: vec![],
    };

    let mut out = match OpenOptions::new().create(true).append(true).open(&report.path) {
        Ok(f) => f,
        Err(e) => {
            let err = PipelineError::io(IoStage::Append, report.path.display(), e);
            progress.warning(format!("{}: segment unusable, {} frames lost: {}", op_id, frames.len(), err));
            report.failures = frames.iter().map(|f| ChunkFailure::new(f.index, &err)).collect();
            return report;
        }
    };

    fill_segment(&mut out, &op_id, frames, geometry, policy, progress, &mut report);
    progress.clear_operation(&op_id, Some("done"));
    report
}

/// Append-only segment storage that can roll back a partial append.
trait SegmentSink: Write {
    fn committed_len(&mut self) -> io::Result<u64>;
    fn rollback_to(&mut self, len: u64) -> io::Result<()>;
}

impl SegmentSink for File {
    fn committed_len(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn rollback_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

fn fill_segment<S: SegmentSink>(
    out: &mut S,
    op_id: &str,
    frames: &[FrameRef],
    geometry: Geometry,
    policy: GapPolicy,
    progress: &ProgressHandle,
    report: &mut SegmentReport,
) {
    for (pos, frame_ref) in frames.iter().enumerate() {
        progress.set_operation_status(
            op_id.to_string(),
            format!("frame={} ({}/{})", frame_ref.index, pos + 1, frames.len()),
        );

        let bytes = match decode_one(frame_ref, geometry) {
            Ok(bytes) => bytes,
            Err(err) => {
                report.failures.push(ChunkFailure::new(frame_ref.index, &err));
                match policy {
                    GapPolicy::Skip => {
                        progress.warning(format!("{}: frame {} skipped: {}", op_id, frame_ref.index, err));
                        continue;
                    }
                    GapPolicy::ZeroFill => {
                        progress.warning(format!("{}: frame {} zero-filled: {}", op_id, frame_ref.index, err));
                        vec![0u8; geometry.buffer_size()]
                    }
                }
            }
        };

        let written = match append_frame(out, &bytes) {
            Ok(()) => bytes.len(),
            Err(err) => {
                let err = PipelineError::io(IoStage::Append, report.path.display(), err);
                report.failures.push(ChunkFailure::new(frame_ref.index, &err));
                match policy {
                    GapPolicy::Skip => {
                        progress.warning(format!("{}: frame {} lost: {}", op_id, frame_ref.index, err));
                        continue;
                    }
                    GapPolicy::ZeroFill => match append_frame(out, &vec![0u8; geometry.buffer_size()]) {
                        Ok(()) => {
                            progress.warning(format!("{}: frame {} zero-filled: {}", op_id, frame_ref.index, err));
                            geometry.buffer_size()
                        }
                        Err(e) => {
                            progress.warning(format!(
                                "{}: frame {} lost, zero fill failed too: {}: {}",
                                op_id, frame_ref.index, err, e
                            ));
                            continue;
                        }
                    },
                }
            }
        };
        report.written_frames += 1;
        report.bytes_written += written as u64;
        progress.inc_bytes(written as u64);
    }
}

/// Appends a whole frame or nothing: a partial write is cut off again.
fn append_frame<S: SegmentSink>(out: &mut S, bytes: &[u8]) -> io::Result<()> {
    let before = out.committed_len()?;
    if let Err(e) = out.write_all(bytes).and_then(|_| out.flush()) {
        if let Err(rollback) = out.rollback_to(before) {
            return Err(io::Error::new(
                rollback.kind(),
                format!("{}; rollback to {} bytes failed: {}", e, before, rollback),
            ));
        }
        return Err(e);
    }
    Ok(())
}

fn decode_one(frame_ref: &FrameRef, geometry: Geometry) -> Result<Vec<u8>, PipelineError> {
    let raster = frame::read_frame(&frame_ref.path)?;
    let (w, h) = raster.dimensions();
    if (w, h) != (geometry.width, geometry.height) {
        return Err(PipelineError::io(
            IoStage::Decode,
            frame_ref.path.display(),
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame is {}x{}, expected {}x{}", w, h, geometry.width, geometry.height),
            ),
        ));
    }
    Ok(frame::decode_frame(&raster))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_chunk, write_frame};
    use crate::progress::{ProgressConfig, ProgressMode, ProgressReporter};
    use tempfile::TempDir;

    fn quiet() -> ProgressReporter {
        ProgressReporter::new("test", 0, ProgressConfig::new(ProgressMode::Quiet))
    }

    /// Frame `i` is filled with byte `i`.
    fn write_frames(dir: &Path, count: usize, g: Geometry) -> Vec<FrameRef> {
        (1..=count)
            .map(|i| {
                let path = dir.join(format!("frame{}.png", i));
                write_frame(&path, &encode_chunk(&vec![i as u8; g.buffer_size()], g)).expect("write frame");
                FrameRef { index: i, path }
            })
            .collect()
    }

    fn segment_values(report: &SegmentReport, g: Geometry) -> Vec<u8> {
        let bytes = std::fs::read(&report.path).expect("read segment");
        assert_eq!(bytes.len() % g.buffer_size(), 0);
        bytes.chunks(g.buffer_size()).map(|c| c[0]).collect()
    }

    #[test]
    fn slices_land_in_worker_order() {
        let tmp = TempDir::new().expect("tempdir");
        let g = Geometry::new(6, 3);
        let frames = write_frames(tmp.path(), 10, g);
        let seg_dir = tmp.path().join("segments");
        std::fs::create_dir_all(&seg_dir).expect("mkdir");

        let reporter = quiet();
        let reports = decode_frames(&frames, g, 3, &seg_dir, GapPolicy::Skip, &reporter.handle()).expect("decode");

        assert_eq!(reports.len(), 3);
        assert_eq!(reports.iter().map(|r| r.expected_frames).collect::<Vec<_>>(), vec![4, 3, 3]);
        assert_eq!(segment_values(&reports[0], g), vec![1, 2, 3, 4]);
        assert_eq!(segment_values(&reports[1], g), vec![5, 6, 7]);
        assert_eq!(segment_values(&reports[2], g), vec![8, 9, 10]);
        assert!(reports.iter().all(|r| r.failures.is_empty()));
        assert!(reports[0].path.ends_with("segment_1"));
    }

    #[test]
    fn more_workers_than_frames_leaves_empty_segments() {
        let tmp = TempDir::new().expect("tempdir");
        let g = Geometry::new(2, 2);
        let frames = write_frames(tmp.path(), 2, g);
        let reporter = quiet();
        let reports = decode_frames(&frames, g, 4, tmp.path(), GapPolicy::Skip, &reporter.handle()).expect("decode");
        assert_eq!(reports.len(), 4);
        assert_eq!(reports[2].expected_frames, 0);
        assert_eq!(reports[3].bytes_written, 0);
        assert_eq!(segment_values(&reports[0], g), vec![1]);
        assert_eq!(segment_values(&reports[1], g), vec![2]);
    }

    #[test]
    fn unreadable_frame_is_skipped_or_zero_filled() {
        let g = Geometry::new(4, 4);
        for policy in [GapPolicy::Skip, GapPolicy::ZeroFill] {
            let tmp = TempDir::new().expect("tempdir");
            let frames = write_frames(tmp.path(), 4, g);
            std::fs::write(&frames[1].path, b"not a png").expect("corrupt frame");

            let reporter = quiet();
            let reports = decode_frames(&frames, g, 1, tmp.path(), policy, &reporter.handle()).expect("decode");
            let report = &reports[0];
            assert_eq!(report.failures.len(), 1);
            assert_eq!(report.failures[0].index, 2);
            assert_eq!(report.failures[0].stage, IoStage::Decode);

            let values = segment_values(report, g);
            match policy {
                GapPolicy::Skip => assert_eq!(values, vec![1, 3, 4]),
                GapPolicy::ZeroFill => assert_eq!(values, vec![1, 0, 3, 4]),
            }
        }
    }

    #[test]
    fn wrong_sized_frame_counts_as_failure() {
        let tmp = TempDir::new().expect("tempdir");
        let g = Geometry::new(4, 4);
        let mut frames = write_frames(tmp.path(), 2, g);
        let odd = tmp.path().join("frame3.png");
        write_frame(&odd, &encode_chunk(&[9; 9], Geometry::new(3, 3))).expect("write");
        frames.push(FrameRef { index: 3, path: odd });

        let reporter = quiet();
        let reports = decode_frames(&frames, g, 1, tmp.path(), GapPolicy::Skip, &reporter.handle()).expect("decode");
        assert_eq!(reports[0].written_frames, 2);
        assert_eq!(reports[0].failures[0].index, 3);
    }

    #[test]
    fn unopenable_segment_fails_its_whole_slice() {
        let tmp = TempDir::new().expect("tempdir");
        let g = Geometry::new(4, 4);
        let frames = write_frames(tmp.path(), 5, g);
        let missing_dir = tmp.path().join("no/such/dir");

        let reporter = quiet();
        let reports =
            decode_frames(&frames, g, 2, &missing_dir, GapPolicy::ZeroFill, &reporter.handle()).expect("decode");
        assert_eq!(reports[0].expected_frames, 3);
        let failed: Vec<usize> = reports.iter().flat_map(|r| r.failures.iter().map(|f| f.index)).collect();
        assert_eq!(failed, vec![1, 2, 3, 4, 5]);
        assert!(reports
            .iter()
            .flat_map(|r| r.failures.iter())
            .all(|f| f.stage == IoStage::Append));

        let out = tmp.path().join("recovered.bin");
        let combined = crate::combine::combine_segments(&reports, &out, GapPolicy::ZeroFill, g.buffer_size(), &reporter.handle())
            .expect("combine");
        assert_eq!(combined.missing_segments, vec![1, 2]);
        let bytes = std::fs::read(&out).expect("read");
        assert_eq!(bytes.len(), 5 * g.buffer_size());
        assert!(bytes.iter().all(|&b| b == 0));
    }

    /// Accepts `budget` bytes, then fails one write and recovers.
    struct FlakySink {
        data: Vec<u8>,
        budget: Option<usize>,
    }

    impl Write for FlakySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.budget {
                Some(0) => {
                    self.budget = None;
                    Err(io::Error::other("disk full"))
                }
                Some(n) => {
                    let k = n.min(buf.len());
                    self.data.extend_from_slice(&buf[..k]);
                    self.budget = Some(n - k);
                    Ok(k)
                }
                None => {
                    self.data.extend_from_slice(buf);
                    Ok(buf.len())
                }
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SegmentSink for FlakySink {
        fn committed_len(&mut self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn rollback_to(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn partial_append_is_rolled_back_then_gap_policy_applies() {
        let g = Geometry::new(4, 4);
        let bs = g.buffer_size();
        for policy in [GapPolicy::Skip, GapPolicy::ZeroFill] {
            let tmp = TempDir::new().expect("tempdir");
            let frames = write_frames(tmp.path(), 3, g);
            let mut sink = FlakySink {
                data: vec![],
                budget: Some(bs + bs / 2),
            };
            let mut report = SegmentReport {
                worker_id: 1,
                path: segment_path(tmp.path(), 1),
                expected_frames: 3,
                written_frames: 0,
                bytes_written: 0,
                failures: vec![],
            };

            let reporter = quiet();
            fill_segment(&mut sink, "dec01", &frames, g, policy, &reporter.handle(), &mut report);

            assert_eq!(report.failures.len(), 1);
            assert_eq!(report.failures[0].index, 2);
            assert_eq!(report.failures[0].stage, IoStage::Append);
            assert_eq!(sink.data.len() % bs, 0, "no partial frame left behind");
            let values: Vec<u8> = sink.data.chunks(bs).map(|c| c[0]).collect();
            match policy {
                GapPolicy::Skip => assert_eq!(values, vec![1, 3]),
                GapPolicy::ZeroFill => assert_eq!(values, vec![1, 0, 3]),
            }
            assert_eq!(report.bytes_written, sink.data.len() as u64);
        }
    }
}
