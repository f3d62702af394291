use crate::config::GapPolicy;
use crate::decoder::SegmentReport;
use crate::progress::ProgressHandle;

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct CombineReport {
    pub bytes_written: u64,
    /// Worker ids whose segment could not be read.
    pub missing_segments: Vec<usize>,
}

pub fn combine_segments(
    segments: &[SegmentReport],
    output: &Path,
    policy: GapPolicy,
    buffer_size: usize,
    progress: &ProgressHandle,
) -> Result<CombineReport> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let out = File::create(output).with_context(|| format!("create {}", output.display()))?;
    let mut wtr = BufWriter::with_capacity(8 * 1024 * 1024, out);

    let mut ordered = segments.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|s| s.worker_id);

    let mut report = CombineReport::default();
    for seg in ordered {
        let mut src = match File::open(&seg.path) {
            Ok(f) => f,
            Err(e) => {
                report.missing_segments.push(seg.worker_id);
                match policy {
                    GapPolicy::Skip => {
                        progress.warning(format!("segment {} skipped: {}: {}", seg.worker_id, seg.path.display(), e));
                    }
                    GapPolicy::ZeroFill => {
                        let zeros = (seg.expected_frames as u64) * (buffer_size as u64);
                        progress.warning(format!(
                            "segment {} zero-filled ({} bytes): {}: {}",
                            seg.worker_id,
                            zeros,
                            seg.path.display(),
                            e
                        ));
                        io::copy(&mut io::repeat(0).take(zeros), &mut wtr)
                            .with_context(|| format!("write {}", output.display()))?;
                        report.bytes_written += zeros;
                    }
                }
                continue;
            }
        };

        let n = io::copy(&mut src, &mut wtr)
            .with_context(|| format!("append segment {} to {}", seg.worker_id, output.display()))?;
        report.bytes_written += n;
        progress.inc_bytes(n);
    }

    wtr.flush().with_context(|| format!("flush {}", output.display()))?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::segment_path;
    use crate::progress::{ProgressConfig, ProgressMode, ProgressReporter};
    use tempfile::TempDir;

    fn quiet() -> ProgressReporter {
        ProgressReporter::new("test", 0, ProgressConfig::new(ProgressMode::Quiet))
    }

    fn segment(dir: &Path, worker_id: usize, contents: Option<&[u8]>, expected_frames: usize) -> SegmentReport {
        let path = segment_path(dir, worker_id);
        if let Some(bytes) = contents {
            std::fs::write(&path, bytes).expect("write segment");
        }
        SegmentReport {
            worker_id,
            path,
            expected_frames,
            written_frames: expected_frames,
            bytes_written: contents.map(|c| c.len() as u64).unwrap_or(0),
            failures: vec![],
        }
    }

    #[test]
    fn segments_are_joined_by_worker_id() {
        let tmp = TempDir::new().expect("tempdir");
        let segs = vec![
            segment(tmp.path(), 3, Some(b"ghi"), 1),
            segment(tmp.path(), 1, Some(b"abc"), 1),
            segment(tmp.path(), 2, Some(b"def"), 1),
        ];
        let out = tmp.path().join("recovered.bin");
        std::fs::write(&out, b"stale contents that must go").expect("seed output");

        let reporter = quiet();
        let report = combine_segments(&segs, &out, GapPolicy::Skip, 3, &reporter.handle()).expect("combine");
        assert_eq!(std::fs::read(&out).expect("read"), b"abcdefghi");
        assert_eq!(report.bytes_written, 9);
        assert!(report.missing_segments.is_empty());
    }

    #[test]
    fn missing_segment_is_skipped() {
        let tmp = TempDir::new().expect("tempdir");
        let segs = vec![
            segment(tmp.path(), 1, Some(b"abc"), 1),
            segment(tmp.path(), 2, None, 2),
            segment(tmp.path(), 3, Some(b"ghi"), 1),
        ];
        let out = tmp.path().join("recovered.bin");
        let reporter = quiet();
        let report = combine_segments(&segs, &out, GapPolicy::Skip, 3, &reporter.handle()).expect("combine");
        assert_eq!(std::fs::read(&out).expect("read"), b"abcghi");
        assert_eq!(report.missing_segments, vec![2]);
        assert_eq!(reporter.finish("done").warning_count, 1);
    }

    #[test]
    fn missing_segment_is_zero_filled_to_its_frame_count() {
        let tmp = TempDir::new().expect("tempdir");
        let segs = vec![
            segment(tmp.path(), 1, Some(b"abc"), 1),
            segment(tmp.path(), 2, None, 2),
            segment(tmp.path(), 3, Some(b"ghi"), 1),
        ];
        let out = tmp.path().join("recovered.bin");
        let reporter = quiet();
        let report = combine_segments(&segs, &out, GapPolicy::ZeroFill, 3, &reporter.handle()).expect("combine");
        assert_eq!(std::fs::read(&out).expect("read"), b"abc\0\0\0\0\0\0ghi");
        assert_eq!(report.bytes_written, 12);
    }

    #[test]
    fn no_segments_gives_empty_output() {
        let tmp = TempDir::new().expect("tempdir");
        let out = tmp.path().join("nested/recovered.bin");
        let reporter = quiet();
        let report = combine_segments(&[], &out, GapPolicy::Skip, 16, &reporter.handle()).expect("combine");
        assert_eq!(report.bytes_written, 0);
        assert!(std::fs::read(&out).expect("read").is_empty());
    }
}
