use crate::config::{Geometry, GapPolicy};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

pub const MANIFEST_VERSION: u16 = 1;

/// Sidecar written next to an encoded video.
///
/// Frames carry no length information, so this is the only place the true
/// source length lives. Decoding never needs it; it only enables `--trim`
/// and the checksum report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u16,
    pub source_name: String,
    pub source_len: u64,
    pub source_crc32: u32,
    pub source_mtime_unix: Option<i64>,

    pub resolution: Option<String>,
    pub width: u32,
    pub height: u32,
    pub buffer_size: u64,
    pub chunk_count: u64,
    pub fps: u32,

    pub gap_policy: GapPolicy,
    pub failed_chunks: Vec<usize>,
}

impl Manifest {
    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.width, self.height)
    }

    /// The manifest can only vouch for the length if nothing shifted.
    pub fn length_is_reliable(&self) -> bool {
        self.failed_chunks.is_empty() || self.gap_policy == GapPolicy::ZeroFill
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("write manifest {}", path.display()))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("open manifest {}", path.display()))?;
        let m: Manifest = serde_json::from_reader(BufReader::new(f))
            .with_context(|| format!("parse manifest {}", path.display()))?;
        Ok(m)
    }
}

pub fn sidecar_path(video: &Path) -> PathBuf {
    let mut name = video.as_os_str().to_os_string();
    name.push(".manifest.json");
    PathBuf::from(name)
}

/// CRC32 of the first `limit` bytes of `path` (all of it when `None`).
pub fn file_crc32(path: &Path, limit: Option<u64>) -> Result<u32> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader: Box<dyn Read> = match limit {
        Some(n) => Box::new(BufReader::new(f).take(n)),
        None => Box::new(BufReader::new(f)),
    };
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

pub fn mtime_unix(path: &Path) -> Option<i64> {
    std::fs::metadata(path)
        .ok()?
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs() as i64)
}
