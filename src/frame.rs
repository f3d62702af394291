use crate::config::Geometry;
use crate::error::{IoStage, PipelineError};

use image::{GrayImage, ImageError, ImageFormat, Luma};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub type Raster = GrayImage;

pub const FRAME_EXT: &str = "png";

/// Prefix of frame files produced by the demuxer.
pub const DEMUX_PREFIX: &str = "frame";

/// A persisted frame and the chunk index it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRef {
    pub index: usize,
    pub path: PathBuf,
}

// Excess bytes are dropped; the tail stays 0.
pub fn encode_chunk(bytes: &[u8], geometry: Geometry) -> Raster {
    let w = geometry.width;
    let mut raster = GrayImage::new(geometry.width, geometry.height);
    for (i, &b) in bytes.iter().take(geometry.buffer_size()).enumerate() {
        let i = i as u32;
        raster.put_pixel(i % w, i / w, Luma([b]));
    }
    raster
}

pub fn decode_frame(raster: &Raster) -> Vec<u8> {
    let (w, h) = raster.dimensions();
    let mut out = Vec::with_capacity((w as usize) * (h as usize));
    for y in 0..h {
        for x in 0..w {
            out.push(raster.get_pixel(x, y).0[0]);
        }
    }
    out
}

pub fn write_frame(path: &Path, raster: &Raster) -> Result<(), PipelineError> {
    raster
        .save_with_format(path, ImageFormat::Png)
        .map_err(|e| {
            let stage = match e {
                ImageError::IoError(_) => IoStage::Write,
                _ => IoStage::Encode,
            };
            PipelineError::codec(stage, path.display(), e)
        })
}

/// Loads any PNG as 8-bit luminance.
pub fn read_frame(path: &Path) -> Result<Raster, PipelineError> {
    let img = image::open(path).map_err(|e| {
        let stage = match e {
            ImageError::IoError(_) => IoStage::Read,
            _ => IoStage::Decode,
        };
        PipelineError::codec(stage, path.display(), e)
    })?;
    Ok(img.to_luma8())
}

pub fn frame_file_name(index: usize) -> String {
    format!("{}.{}", index, FRAME_EXT)
}

pub fn parse_frame_index(file_name: &str, prefix: &str) -> Option<usize> {
    let stem = file_name.strip_suffix(FRAME_EXT)?.strip_suffix('.')?;
    let digits = stem.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Names without an index come back in the second list, never in the ordering.
pub fn list_frames(dir: &Path, prefix: &str) -> anyhow::Result<(Vec<FrameRef>, Vec<PathBuf>)> {
    let mut frames = vec![];
    let mut rejected = vec![];
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let e = entry?;
        if !e.file_type().is_file() {
            continue;
        }
        let name = e.file_name().to_string_lossy();
        match parse_frame_index(&name, prefix) {
            Some(index) => frames.push(FrameRef {
                index,
                path: e.path().to_path_buf(),
            }),
            None => rejected.push(e.path().to_path_buf()),
        }
    }
    frames.sort_by_key(|f| f.index);
    rejected.sort();
    Ok((frames, rejected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn padded(bytes: &[u8], len: usize) -> Vec<u8> {
        let mut v = bytes.to_vec();
        v.resize(len, 0);
        v
    }

    #[test]
    fn short_chunk_roundtrips_with_zero_padding() {
        let g = Geometry::new(7, 5);
        let data: Vec<u8> = (0..23u8).map(|b| b.wrapping_mul(37).wrapping_add(1)).collect();
        let out = decode_frame(&encode_chunk(&data, g));
        assert_eq!(out.len(), g.buffer_size());
        assert_eq!(out, padded(&data, g.buffer_size()));
    }

    #[test]
    fn full_and_empty_chunks_roundtrip() {
        let g = Geometry::new(4, 4);
        let full: Vec<u8> = (0..16u8).rev().collect();
        assert_eq!(decode_frame(&encode_chunk(&full, g)), full);
        assert_eq!(decode_frame(&encode_chunk(&[], g)), vec![0u8; 16]);
    }

    #[test]
    fn pixels_are_laid_out_row_major() {
        let g = Geometry::new(3, 2);
        let raster = encode_chunk(&[10, 11, 12, 20, 21, 22], g);
        assert_eq!(raster.get_pixel(0, 0).0[0], 10);
        assert_eq!(raster.get_pixel(2, 0).0[0], 12);
        assert_eq!(raster.get_pixel(0, 1).0[0], 20);
        assert_eq!(raster.get_pixel(2, 1).0[0], 22);
    }

    #[test]
    fn excess_input_is_dropped() {
        let g = Geometry::new(2, 2);
        let raster = encode_chunk(&[1, 2, 3, 4, 5, 6], g);
        assert_eq!(decode_frame(&raster), vec![1, 2, 3, 4]);
    }

    #[test]
    fn frame_file_survives_png_roundtrip() {
        let tmp = TempDir::new().expect("tempdir");
        let g = Geometry::new(16, 9);
        let data: Vec<u8> = (0..=255u8).cycle().take(140).collect();
        let path = tmp.path().join(frame_file_name(3));
        write_frame(&path, &encode_chunk(&data, g)).expect("write frame");
        let back = read_frame(&path).expect("read frame");
        assert_eq!(back.dimensions(), (16, 9));
        assert_eq!(decode_frame(&back), padded(&data, g.buffer_size()));
    }

    #[test]
    fn frame_indices_parse_only_exact_names() {
        assert_eq!(parse_frame_index("frame12.png", "frame"), Some(12));
        assert_eq!(parse_frame_index("7.png", ""), Some(7));
        assert_eq!(parse_frame_index("frame.png", "frame"), None);
        assert_eq!(parse_frame_index("frame-1.png", "frame"), None);
        assert_eq!(parse_frame_index("frame3.jpg", "frame"), None);
        assert_eq!(parse_frame_index("thumbs.db", "frame"), None);
    }

    #[test]
    fn listing_orders_numerically_and_rejects_strays() {
        let tmp = TempDir::new().expect("tempdir");
        let g = Geometry::new(2, 2);
        for idx in [10usize, 2, 1] {
            let path = tmp.path().join(format!("frame{}.png", idx));
            write_frame(&path, &encode_chunk(&[idx as u8], g)).expect("write");
        }
        std::fs::write(tmp.path().join("frameX.png"), b"junk").expect("write stray");

        let (frames, rejected) = list_frames(tmp.path(), DEMUX_PREFIX).expect("list");
        let order: Vec<usize> = frames.iter().map(|f| f.index).collect();
        assert_eq!(order, vec![1, 2, 10]);
        assert_eq!(rejected.len(), 1);
        assert!(rejected[0].ends_with("frameX.png"));
    }
}
