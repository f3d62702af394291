use crate::config::Geometry;
use crate::error::{ChunkFailure, IoStage, PipelineError};
use crate::frame::{self, FrameRef};
use crate::plan::{ChunkPlan, ChunkSpec};
use crate::progress::ProgressHandle;

use anyhow::{bail, Result};
use crossbeam_channel::{bounded, Receiver};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::thread;

#[derive(Debug, Default)]
pub struct EncodeReport {
    /// Frames on disk, ordered by chunk index.
    pub frames: Vec<FrameRef>,
    /// Chunks that were skipped, ordered by chunk index.
    pub failures: Vec<ChunkFailure>,
    pub bytes_read: u64,
}

impl EncodeReport {
    pub fn failed_indices(&self) -> Vec<usize> {
        self.failures.iter().map(|f| f.index).collect()
    }
}

#[derive(Default)]
struct WorkerOutcome {
    frames: Vec<FrameRef>,
    failures: Vec<ChunkFailure>,
    bytes_read: u64,
}

/// Every worker opens its own reader through `open_source`.
pub fn encode_chunks<R, F>(
    plan: &ChunkPlan,
    geometry: Geometry,
    workers: usize,
    frame_dir: &Path,
    open_source: F,
    progress: &ProgressHandle,
) -> Result<EncodeReport>
where
    R: Read + Seek,
    F: Fn() -> std::io::Result<R> + Sync,
{
    if workers == 0 {
        return Err(PipelineError::InvalidConfig("worker count must be positive".to_string()).into());
    }
    if plan.buffer_size != geometry.buffer_size() {
        return Err(PipelineError::InvalidConfig(format!(
            "buffer size {} does not match {}x{} frame",
            plan.buffer_size, geometry.width, geometry.height
        ))
        .into());
    }

    let (tx, rx) = bounded::<usize>(plan.chunk_count.max(1));
    for index in 1..=plan.chunk_count {
        if tx.send(index).is_err() {
            bail!("chunk queue closed while filling");
        }
    }
    drop(tx);

    let open_source = &open_source;
    let outcomes = thread::scope(|s| {
        let handles = (1..=workers)
            .map(|worker_id| {
                let rx = rx.clone();
                s.spawn(move || encode_worker(worker_id, rx, plan, geometry, frame_dir, open_source, progress))
            })
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .enumerate()
            .map(|(i, h)| h.join().map_err(|_| i + 1))
            .collect::<Vec<_>>()
    });

    let mut report = EncodeReport::default();
    for outcome in outcomes {
        match outcome {
            Ok(o) => {
                report.frames.extend(o.frames);
                report.failures.extend(o.failures);
                report.bytes_read += o.bytes_read;
            }
            Err(worker_id) => bail!("encode worker {} panicked", worker_id),
        }
    }
    report.frames.sort_by_key(|f| f.index);
    report.failures.sort_by_key(|f| f.index);
    Ok(report)
}

fn encode_worker<R, F>(
    worker_id: usize,
    queue: Receiver<usize>,
    plan: &ChunkPlan,
    geometry: Geometry,
    frame_dir: &Path,
    open_source: &F,
    progress: &ProgressHandle,
) -> WorkerOutcome
where
    R: Read + Seek,
    F: Fn() -> std::io::Result<R>,
{
    let op_id = format!("enc{:02}", worker_id);
    let mut out = WorkerOutcome::default();
    let mut reader: Option<R> = None;
    let mut buf = vec![0u8; plan.buffer_size];

    for index in queue.iter() {
        let Some(spec) = plan.chunk(index) else {
            continue;
        };
        progress.set_operation_status(op_id.clone(), format!("chunk={}/{}", index, plan.chunk_count));

        match encode_one(&spec, &mut reader, open_source, &mut buf, geometry, frame_dir) {
            Ok(frame) => {
                out.bytes_read += spec.len as u64;
                progress.inc_bytes(spec.len as u64);
                out.frames.push(frame);
            }
            Err(err) => {
                progress.warning(format!("{}: chunk {} skipped: {}", op_id, index, err));
                out.failures.push(ChunkFailure::new(index, &err));
            }
        }
    }

    progress.clear_operation(&op_id, Some("done"));
    out
}

fn encode_one<R, F>(
    spec: &ChunkSpec,
    reader: &mut Option<R>,
    open_source: &F,
    buf: &mut [u8],
    geometry: Geometry,
    frame_dir: &Path,
) -> Result<FrameRef, PipelineError>
where
    R: Read + Seek,
    F: Fn() -> std::io::Result<R>,
{
    let target = format!("chunk {}", spec.index);
    let mut r = match reader.take() {
        Some(r) => r,
        None => open_source().map_err(|e| PipelineError::io(IoStage::Open, &target, e))?,
    };

    let data = &mut buf[..spec.len];
    r.seek(SeekFrom::Start(spec.offset))
        .map_err(|e| PipelineError::io(IoStage::Seek, &target, e))?;
    r.read_exact(data)
        .map_err(|e| PipelineError::io(IoStage::Read, &target, e))?;
    // A handle that just failed is dropped above; the next chunk reopens.
    *reader = Some(r);

    let raster = frame::encode_chunk(data, geometry);
    let path = frame_dir.join(frame::frame_file_name(spec.index));
    frame::write_frame(&path, &raster)?;
    Ok(FrameRef {
        index: spec.index,
        path,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::{self, Read, Seek, SeekFrom};

    /// Fails any read that starts at `fail_offset`.
    pub struct FailAt<R> {
        pub inner: R,
        pub fail_offset: u64,
        pub pos: u64,
    }

    impl<R> FailAt<R> {
        pub fn new(inner: R, fail_offset: u64) -> Self {
            Self {
                inner,
                fail_offset,
                pos: 0,
            }
        }
    }

    impl<R: Read> Read for FailAt<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.fail_offset {
                return Err(io::Error::new(io::ErrorKind::Other, "injected read failure"));
            }
            let n = self.inner.read(buf)?;
            self.pos += n as u64;
            Ok(n)
        }
    }

    impl<R: Seek> Seek for FailAt<R> {
        fn seek(&mut self, to: SeekFrom) -> io::Result<u64> {
            self.pos = self.inner.seek(to)?;
            Ok(self.pos)
        }
    }

    pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| seed.wrapping_add((i % 251) as u8).wrapping_add(1))
            .collect()
    }
}
