use clap::{Args, Parser, Subcommand};
use ffbd::engine::bd::BdMode;
use ffbd::engine::job::JobStatus;
use ffbd::engine::RawParams;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ffbd")]
#[command(about = "Rate-distortion analysis of video encodes", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check if ffmpeg and ffprobe are installed and ffmpeg has libvmaf
    CheckFfmpeg,

    /// Probe a video file and print its stream properties
    Probe {
        /// Path to the video file
        file: PathBuf,
    },

    /// Score encoded files against a reference and write a bitstream report
    Analyze {
        /// Reference (original) video
        reference: PathBuf,

        /// Encoded files to score
        #[arg(required = true)]
        encoded: Vec<PathBuf>,

        #[command(flatten)]
        raw: RawArgs,

        /// Directory for the report and intermediate files
        #[arg(long, default_value = "analysis")]
        out: PathBuf,
    },

    /// Run a comparison or metrics-analysis template in the foreground
    RunTemplate {
        /// Template file (.toml or .json)
        template: PathBuf,

        /// Directory receiving encodes, logs and the report
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,

        /// Fail on the first per-pair error (overrides config)
        #[arg(long)]
        strict: bool,
    },

    /// Queue a job for the background worker
    Submit {
        #[command(subcommand)]
        request: SubmitCommand,
    },

    /// List queued and finished jobs
    Jobs {
        /// Only show jobs with this status
        #[arg(long, value_parser = parse_status)]
        status: Option<JobStatus>,
    },

    /// Print a job document as JSON
    Show {
        /// Job id
        id: String,
    },

    /// Process queued jobs one at a time
    Worker {
        /// Process at most one job, then exit
        #[arg(long)]
        once: bool,
    },

    /// Compute BD-Rate and BD-Metric between two rate-distortion curves
    Bd {
        /// Anchor points as RATE:METRIC, comma separated
        #[arg(long, required = true, value_delimiter = ',', value_parser = parse_point)]
        anchor: Vec<(f64, f64)>,

        /// Test points as RATE:METRIC, comma separated
        #[arg(long, required = true, value_delimiter = ',', value_parser = parse_point)]
        test: Vec<(f64, f64)>,

        /// Integration mode: auto, polynomial or piecewise
        #[arg(long, default_value = "auto", value_parser = parse_mode)]
        mode: BdMode,
    },

    /// Show config status and location, or create default config if missing
    InitConfig,
}

#[derive(Subcommand)]
pub enum SubmitCommand {
    /// Queue a template; its kind selects comparison or metrics analysis
    Template {
        /// Template file (.toml or .json)
        file: PathBuf,
    },

    /// Queue a single-reference bitstream analysis
    Bitstream {
        reference: PathBuf,

        #[arg(required = true)]
        encoded: Vec<PathBuf>,

        #[command(flatten)]
        raw: RawArgs,
    },
}

/// Geometry of a raw reference whose name does not carry it
#[derive(Args, Debug, Clone, Default)]
pub struct RawArgs {
    /// Frame width of a raw reference
    #[arg(long, requires_all = ["height", "fps"])]
    pub width: Option<u32>,

    /// Frame height of a raw reference
    #[arg(long, requires_all = ["width", "fps"])]
    pub height: Option<u32>,

    /// Frame rate of a raw reference
    #[arg(long, requires_all = ["width", "height"])]
    pub fps: Option<f64>,

    /// Pixel format of a raw reference
    #[arg(long, default_value = "yuv420p")]
    pub pix_fmt: String,
}

impl RawArgs {
    pub fn params(&self) -> Option<RawParams> {
        let (width, height, fps) = (self.width?, self.height?, self.fps?);
        Some(RawParams {
            pixel_format: self.pix_fmt.clone(),
            ..RawParams::new(width, height, fps)
        })
    }
}

fn parse_point(s: &str) -> Result<(f64, f64), String> {
    let (rate, metric) = s
        .split_once(':')
        .ok_or_else(|| format!("expected RATE:METRIC, got '{s}'"))?;
    let rate: f64 = rate
        .trim()
        .parse()
        .map_err(|_| format!("invalid rate '{rate}'"))?;
    let metric: f64 = metric
        .trim()
        .parse()
        .map_err(|_| format!("invalid metric '{metric}'"))?;
    Ok((rate, metric))
}

fn parse_status(s: &str) -> Result<JobStatus, String> {
    match s {
        "pending" => Ok(JobStatus::Pending),
        "processing" => Ok(JobStatus::Processing),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        other => Err(format!(
            "unknown status '{other}' (pending, processing, completed, failed)"
        )),
    }
}

fn parse_mode(s: &str) -> Result<BdMode, String> {
    match s {
        "auto" => Ok(BdMode::Auto),
        "polynomial" => Ok(BdMode::Polynomial),
        "piecewise" => Ok(BdMode::Piecewise),
        other => Err(format!(
            "unknown mode '{other}' (auto, polynomial, piecewise)"
        )),
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}
