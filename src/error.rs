use std::fmt;
use thiserror::Error;

/// Where in a chunk's journey an I/O or codec failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStage {
    Open,
    Seek,
    Read,
    Encode,
    Write,
    Decode,
    Append,
}

impl fmt::Display for IoStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IoStage::Open => "open",
            IoStage::Seek => "seek",
            IoStage::Read => "read",
            IoStage::Encode => "encode",
            IoStage::Write => "write",
            IoStage::Decode => "decode",
            IoStage::Append => "append",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("{stage} failed for {target}: {source}")]
    Io {
        stage: IoStage,
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} failed for {target}: {source}")]
    Codec {
        stage: IoStage,
        target: String,
        #[source]
        source: image::ImageError,
    },

    #[error("{program} exited with {status}: {stderr_tail}")]
    ExternalProcess {
        program: String,
        status: String,
        stderr_tail: String,
    },
}

impl PipelineError {
    pub fn io(stage: IoStage, target: impl fmt::Display, source: std::io::Error) -> Self {
        PipelineError::Io {
            stage,
            target: target.to_string(),
            source,
        }
    }

    pub fn codec(stage: IoStage, target: impl fmt::Display, source: image::ImageError) -> Self {
        PipelineError::Codec {
            stage,
            target: target.to_string(),
            source,
        }
    }

    pub fn stage(&self) -> Option<IoStage> {
        match self {
            PipelineError::Io { stage, .. } | PipelineError::Codec { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// A chunk or frame that did not make it through its pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub index: usize,
    pub stage: IoStage,
    pub message: String,
}

impl ChunkFailure {
    pub fn new(index: usize, err: &PipelineError) -> Self {
        Self {
            index,
            stage: err.stage().unwrap_or(IoStage::Read),
            message: err.to_string(),
        }
    }
}
