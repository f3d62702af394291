mod autotune;
mod combine;
mod config;
mod decoder;
mod encoder;
mod error;
mod frame;
mod manifest;
mod pipeline;
mod plan;
mod progress;
mod transport;
mod util;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{DecodeConfig, EncodeConfig, GapPolicy, Resolution, DEFAULT_FPS};
use indicatif::HumanBytes;
use progress::{
    format_duration, format_rate, DecodeSummary, EncodeSummary, ProgressConfig, ProgressMode, ProgressReporter,
    VerifySummary,
};
use std::path::PathBuf;
use transport::FfmpegTransport;

#[derive(Parser)]
#[command(
    name = "bytereel",
    version,
    about = "Byte-exact file<->video codec (bytes->grayscale frames->lossless video)"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Args, Clone)]
struct PipelineOpts {
    /// Frame preset: 120, 240, 480, 720, 1080, 1440 or 4k. Must match between encode and decode.
    #[arg(long, env = "RESOLUTION", value_enum, default_value = "480")]
    resolution: Resolution,

    /// Worker count. Default: auto (cores and free memory).
    #[arg(long, env = "WORKERS")]
    workers: Option<usize>,

    /// Frame rate written into the video. Decode prefers the rate in the manifest sidecar.
    #[arg(long, default_value_t = DEFAULT_FPS)]
    fps: u32,

    /// What to put where a chunk, frame or segment went missing.
    #[arg(long, value_enum, default_value_t = GapPolicy::Skip)]
    gap_policy: GapPolicy,

    /// Parent directory for intermediate frames and segments. Default: system temp dir.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Keep intermediate frames and segments after the run.
    #[arg(long, default_value_t = false)]
    keep_work_dir: bool,

    /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
    #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
    progress: ProgressMode,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a file into a lossless grayscale video (plus a manifest sidecar)
    Encode {
        input: PathBuf,
        video: PathBuf,

        #[command(flatten)]
        opts: PipelineOpts,
    },

    /// Decode a video back into the bytes it carries
    Decode {
        video: PathBuf,
        output: PathBuf,

        /// Cut frame padding using the manifest sidecar, when its length can be trusted.
        #[arg(long, default_value_t = false)]
        trim: bool,

        #[command(flatten)]
        opts: PipelineOpts,
    },

    /// Quick roundtrip test on a file (encode then decode then verify bytes)
    Roundtrip {
        input: PathBuf,
        temp_dir: PathBuf,

        /// Trim padding before verifying.
        #[arg(long, default_value_t = false)]
        trim: bool,

        #[command(flatten)]
        opts: PipelineOpts,
    },
}

struct Resolved {
    encode: EncodeConfig,
    decode: DecodeConfig,
    transport: FfmpegTransport,
}

impl PipelineOpts {
    /// Validates before anything touches ffmpeg or the filesystem.
    fn resolve(&self, trim: bool) -> Result<Resolved> {
        let geometry = self.resolution.geometry();
        let (workers, ffmpeg_threads) = match self.workers {
            Some(w) => (w, num_cpus::get()),
            None => {
                let tune = autotune::auto_tune(geometry.buffer_size());
                (tune.workers, tune.ffmpeg_threads)
            }
        };

        let mut encode = EncodeConfig::new(self.resolution, workers);
        encode.fps = self.fps;
        encode.gap_policy = self.gap_policy;
        encode.work_root = self.work_dir.clone();
        encode.keep_work_dir = self.keep_work_dir;
        encode.validate()?;

        let mut decode = DecodeConfig::new(self.resolution, workers);
        decode.fps = self.fps;
        decode.gap_policy = self.gap_policy;
        decode.trim = trim;
        decode.work_root = self.work_dir.clone();
        decode.keep_work_dir = self.keep_work_dir;
        decode.validate()?;

        Ok(Resolved {
            encode,
            decode,
            transport: FfmpegTransport::new(ffmpeg_threads),
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Encode { input, video, opts } => {
            let r = opts.resolve(false)?;
            transport::ensure_ffmpeg_available().context("ffmpeg not found in PATH")?;
            let summary = pipeline::encode_file(
                &input,
                &video,
                &r.encode,
                &r.transport,
                ProgressConfig::new(opts.progress),
            )?;
            print_encode_summary(&summary);
        }

        Commands::Decode {
            video,
            output,
            trim,
            opts,
        } => {
            let r = opts.resolve(trim)?;
            transport::ensure_ffmpeg_available().context("ffmpeg not found in PATH")?;
            let summary = pipeline::decode_video(
                &video,
                &output,
                &r.decode,
                &r.transport,
                ProgressConfig::new(opts.progress),
            )?;
            print_decode_summary(&summary);
        }

        Commands::Roundtrip {
            input,
            temp_dir,
            trim,
            opts,
        } => {
            let r = opts.resolve(trim)?;
            transport::ensure_ffmpeg_available().context("ffmpeg not found in PATH")?;
            std::fs::create_dir_all(&temp_dir)?;
            let (video, recovered) = pipeline::roundtrip_paths(&temp_dir, &input);

            let progress_cfg = ProgressConfig::new(opts.progress);
            let phases = ProgressReporter::new("roundtrip", 3, progress_cfg);
            let phase_handle = phases.handle();

            phase_handle.set_stage("phase 1/3: encode");
            phase_handle.set_operation_status("encode", "running");
            let enc_summary = pipeline::encode_file(&input, &video, &r.encode, &r.transport, progress_cfg)?;
            phase_handle.clear_operation("encode", Some("encode complete"));
            phase_handle.inc_bytes(1);

            phase_handle.set_stage("phase 2/3: decode");
            phase_handle.set_operation_status("decode", "running");
            let dec_summary = pipeline::decode_video(&video, &recovered, &r.decode, &r.transport, progress_cfg)?;
            phase_handle.clear_operation("decode", Some("decode complete"));
            phase_handle.inc_bytes(1);

            phase_handle.set_stage("phase 3/3: verify");
            phase_handle.set_operation_status("verify", "comparing bytes");
            let verify_summary = util::verify_recovered(&input, &recovered)?;
            phase_handle.clear_operation("verify", Some("verify complete"));
            phase_handle.inc_bytes(1);

            let roundtrip_outcome = phases.finish("roundtrip complete");

            println!("Roundtrip: OK");
            print_encode_summary(&enc_summary);
            print_decode_summary(&dec_summary);
            print_verify_summary(&verify_summary);
            println!(
                "Roundtrip summary: duration={} phases={}/{} warnings={} rate={}",
                format_duration(roundtrip_outcome.elapsed),
                roundtrip_outcome.processed_bytes,
                roundtrip_outcome.total_bytes,
                roundtrip_outcome.warning_count,
                format_rate(roundtrip_outcome.avg_bytes_per_sec)
            );
            for warning in roundtrip_outcome.warnings {
                println!("  warning: {}", warning);
            }
        }
    }

    Ok(())
}

fn print_encode_summary(summary: &EncodeSummary) {
    println!(
        "Encode summary: input={} video={} manifest={} frame={}x{} duration={} throughput={} bytes={} / {} chunks={} frames={} failed_chunks={} gap_policy={} workers={} muxed={} warnings={}",
        summary.input.display(),
        summary.video.display(),
        summary
            .manifest
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string()),
        summary.width,
        summary.height,
        format_duration(summary.elapsed),
        format_rate(summary.avg_bytes_per_sec),
        HumanBytes(summary.processed_bytes),
        HumanBytes(summary.source_bytes),
        summary.chunk_count,
        summary.frames_written,
        format_indices(&summary.failed_chunks),
        summary.gap_policy,
        summary.workers,
        summary.muxed,
        summary.warning_count,
    );
    for warning in &summary.warnings {
        println!("  warning: {}", warning);
    }
}

fn print_decode_summary(summary: &DecodeSummary) {
    println!(
        "Decode summary: video={} output={} duration={} throughput={} frames={} rejected={} failed_frames={} missing_segments={} bytes={} padding={} crc_match={} trimmed={} gap_policy={} workers={} warnings={}",
        summary.video.display(),
        summary.output.display(),
        format_duration(summary.elapsed),
        format_rate(summary.avg_bytes_per_sec),
        summary.frame_count,
        summary.rejected_frames,
        format_indices(&summary.failed_frames),
        format_indices(&summary.missing_segments),
        summary.recovered_bytes,
        summary
            .padding_bytes
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        summary
            .crc_match
            .map(|m| m.to_string())
            .unwrap_or_else(|| "-".to_string()),
        summary.trimmed,
        summary.gap_policy,
        summary.workers,
        summary.warning_count,
    );
    for warning in &summary.warnings {
        println!("  warning: {}", warning);
    }
}

fn print_verify_summary(summary: &VerifySummary) {
    println!(
        "Verify summary: duration={} throughput={} source_bytes={} recovered_bytes={} padding={}",
        format_duration(summary.elapsed),
        format_rate(summary.avg_bytes_per_sec),
        summary.source_bytes,
        summary.recovered_bytes,
        summary.padding_bytes,
    );
}

fn format_indices(indices: &[usize]) -> String {
    if indices.is_empty() {
        return "-".to_string();
    }
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
