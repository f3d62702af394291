use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Instant;

use crate::progress::{average_rate, VerifySummary};

/// Bytes past the source length must all be zero.
pub fn verify_recovered(source: &Path, recovered: &Path) -> Result<VerifySummary> {
    let started = Instant::now();
    let mut src = BufReader::new(File::open(source).with_context(|| format!("open {}", source.display()))?);
    let mut dst =
        BufReader::new(File::open(recovered).with_context(|| format!("open {}", recovered.display()))?);

    let mut a = vec![0u8; 1024 * 1024];
    let mut b = vec![0u8; 1024 * 1024];
    let mut offset = 0u64;
    loop {
        let n = src.read(&mut a)?;
        if n == 0 {
            break;
        }
        let got = read_up_to(&mut dst, &mut b[..n])?;
        if let Some(i) = (0..got).find(|&i| a[i] != b[i]) {
            bail!("recovered file differs from source at offset {}", offset + i as u64);
        }
        if got < n {
            bail!(
                "recovered file is truncated: {} bytes, source has at least {}",
                offset + got as u64,
                offset + n as u64
            );
        }
        offset += n as u64;
    }

    let source_bytes = offset;
    let mut padding_bytes = 0u64;
    loop {
        let n = dst.read(&mut b)?;
        if n == 0 {
            break;
        }
        if let Some(i) = b[..n].iter().position(|&x| x != 0) {
            bail!(
                "non-zero byte after the source length at offset {}",
                source_bytes + padding_bytes + i as u64
            );
        }
        padding_bytes += n as u64;
    }

    let elapsed = started.elapsed();
    Ok(VerifySummary {
        source_bytes,
        recovered_bytes: source_bytes + padding_bytes,
        padding_bytes,
        elapsed,
        avg_bytes_per_sec: average_rate(source_bytes, elapsed),
    })
}

fn read_up_to(r: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
