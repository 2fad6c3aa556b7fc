// Global configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::engine::{AnalysisSettings, Toolchain};

pub const ENV_FFMPEG_DIR: &str = "FFBD_FFMPEG_DIR";
pub const ENV_JOBS_ROOT: &str = "FFBD_JOBS_ROOT";
pub const ENV_TIMEOUT_SECS: &str = "FFBD_TIMEOUT_SECS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Directory holding ffmpeg and ffprobe (PATH lookup when unset)
    #[serde(default)]
    pub ffmpeg_dir: Option<PathBuf>,

    #[serde(default = "default_x264")]
    pub x264: PathBuf,

    #[serde(default = "default_x265")]
    pub x265: PathBuf,

    #[serde(default = "default_vvenc")]
    pub vvencapp: PathBuf,

    /// Upper bound for a single external command
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Run PSNR, SSIM and VMAF passes of one pair concurrently
    #[serde(default = "default_true")]
    pub parallel_metrics: bool,

    #[serde(default = "default_vmaf_threads")]
    pub vmaf_threads: u32,

    #[serde(default = "default_cpu_sample_interval_ms")]
    pub cpu_sample_interval_ms: u64,

    /// Fail a run on its first per-pair error
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_jobs_root")]
    pub jobs_root: PathBuf,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_x264() -> PathBuf {
    PathBuf::from("x264")
}

fn default_x265() -> PathBuf {
    PathBuf::from("x265")
}

fn default_vvenc() -> PathBuf {
    PathBuf::from("vvencapp")
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_vmaf_threads() -> u32 {
    8
}

fn default_cpu_sample_interval_ms() -> u64 {
    100
}

fn default_jobs_root() -> PathBuf {
    PathBuf::from("jobs")
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_dir: None,
            x264: default_x264(),
            x265: default_x265(),
            vvencapp: default_vvenc(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            parallel_metrics: true,
            vmaf_threads: default_vmaf_threads(),
            cpu_sample_interval_ms: default_cpu_sample_interval_ms(),
            strict: false,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            jobs_root: default_jobs_root(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("ffbd");
        Ok(config_dir.join("config.toml"))
    }

    /// Load config from disk (defaults when absent), then apply environment
    /// overrides
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        let mut config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            Config::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Save config to disk
    pub fn save(&self) -> Result<PathBuf> {
        let config_path = Self::config_path()?;
        self.save_to(&config_path)?;
        Ok(config_path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Check if config file exists
    pub fn exists() -> bool {
        Self::config_path().map(|p| p.exists()).unwrap_or(false)
    }

    /// Apply `FFBD_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_FFMPEG_DIR).filter(|d| !d.is_empty()) {
            self.tools.ffmpeg_dir = Some(PathBuf::from(dir));
        }
        if let Some(root) = lookup(ENV_JOBS_ROOT).filter(|r| !r.is_empty()) {
            self.worker.jobs_root = PathBuf::from(root);
        }
        if let Some(secs) = lookup(ENV_TIMEOUT_SECS) {
            self.tools.timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("{ENV_TIMEOUT_SECS} must be a number of seconds, got {secs:?}"))?;
        }
        Ok(())
    }

    pub fn toolchain(&self) -> Toolchain {
        let base = match &self.tools.ffmpeg_dir {
            Some(dir) => Toolchain::in_dir(dir),
            None => Toolchain::default(),
        };
        Toolchain {
            x264: self.tools.x264.clone(),
            x265: self.tools.x265.clone(),
            vvenc: self.tools.vvencapp.clone(),
            timeout: Duration::from_secs(self.tools.timeout_secs),
            ..base
        }
    }

    pub fn settings(&self) -> AnalysisSettings {
        if self.analysis.vmaf_threads == 0 {
            warn!("vmaf_threads is 0, using 1");
        }
        AnalysisSettings {
            parallel_metrics: self.analysis.parallel_metrics,
            vmaf_threads: self.analysis.vmaf_threads.max(1),
            cpu_sample_interval: Duration::from_millis(self.analysis.cpu_sample_interval_ms.max(1)),
            strict: self.analysis.strict,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.worker.poll_interval_secs.max(1))
    }
}
