use crate::error::PipelineError;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_FPS: u32 = 30;

/// Named frame presets. Each frame carries `width * height` payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Resolution {
    #[value(name = "120")]
    #[serde(rename = "120")]
    R120,
    #[value(name = "240")]
    #[serde(rename = "240")]
    R240,
    #[value(name = "480")]
    #[serde(rename = "480")]
    R480,
    #[value(name = "720")]
    #[serde(rename = "720")]
    R720,
    #[value(name = "1080")]
    #[serde(rename = "1080")]
    R1080,
    #[value(name = "1440")]
    #[serde(rename = "1440")]
    R1440,
    #[value(name = "4k", alias = "4K")]
    #[serde(rename = "4k")]
    R4k,
}

impl Resolution {
    pub fn geometry(self) -> Geometry {
        let (width, height) = match self {
            Resolution::R120 => (160, 120),
            Resolution::R240 => (320, 240),
            Resolution::R480 => (640, 480),
            Resolution::R720 => (1280, 720),
            Resolution::R1080 => (1920, 1080),
            Resolution::R1440 => (2560, 1440),
            Resolution::R4k => (3840, 2160),
        };
        Geometry { width, height }
    }

    pub fn name(self) -> &'static str {
        match self {
            Resolution::R120 => "120",
            Resolution::R240 => "240",
            Resolution::R480 => "480",
            Resolution::R720 => "720",
            Resolution::R1080 => "1080",
            Resolution::R1440 => "1440",
            Resolution::R4k => "4k",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn buffer_size(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.width == 0 || self.height == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "frame geometry must be non-empty, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

/// What to put where a chunk, frame or segment went missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[value(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum GapPolicy {
    /// Leave the bytes out; everything after the gap shifts forward.
    #[default]
    Skip,
    /// Write `buffer_size` zero bytes per missing frame.
    ZeroFill,
}

impl GapPolicy {
    pub fn name(self) -> &'static str {
        match self {
            GapPolicy::Skip => "skip",
            GapPolicy::ZeroFill => "zero-fill",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncodeConfig {
    pub geometry: Geometry,
    pub resolution: Option<Resolution>,
    pub workers: usize,
    pub fps: u32,
    pub gap_policy: GapPolicy,
    pub work_root: Option<PathBuf>,
    pub keep_work_dir: bool,
}

impl EncodeConfig {
    pub fn new(resolution: Resolution, workers: usize) -> Self {
        Self {
            geometry: resolution.geometry(),
            resolution: Some(resolution),
            workers,
            fps: DEFAULT_FPS,
            gap_policy: GapPolicy::Skip,
            work_root: None,
            keep_work_dir: false,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        self.geometry.validate()?;
        validate_workers(self.workers)?;
        validate_fps(self.fps)
    }
}

#[derive(Debug, Clone)]
pub struct DecodeConfig {
    pub geometry: Geometry,
    pub workers: usize,
    pub fps: u32,
    pub gap_policy: GapPolicy,
    pub trim: bool,
    pub work_root: Option<PathBuf>,
    pub keep_work_dir: bool,
}

impl DecodeConfig {
    pub fn new(resolution: Resolution, workers: usize) -> Self {
        Self {
            geometry: resolution.geometry(),
            workers,
            fps: DEFAULT_FPS,
            gap_policy: GapPolicy::Skip,
            trim: false,
            work_root: None,
            keep_work_dir: false,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        self.geometry.validate()?;
        validate_workers(self.workers)?;
        validate_fps(self.fps)
    }
}

fn validate_workers(workers: usize) -> Result<(), PipelineError> {
    if workers == 0 {
        return Err(PipelineError::InvalidConfig(
            "worker count must be a positive integer".to_string(),
        ));
    }
    Ok(())
}

fn validate_fps(fps: u32) -> Result<(), PipelineError> {
    if fps == 0 {
        return Err(PipelineError::InvalidConfig("fps must be positive".to_string()));
    }
    Ok(())
}
