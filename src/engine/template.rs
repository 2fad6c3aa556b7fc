// Encoding templates: one or two sides describing sources, encoder and points

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

use super::core::CANONICAL_PIX_FMT;
use super::encode::EncoderKind;
use super::error::AnalysisError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateControl {
    Crf,
    Abr,
}

impl RateControl {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateControl::Crf => "crf",
            RateControl::Abr => "abr",
        }
    }
}

impl fmt::Display for RateControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    #[default]
    Comparison,
    MetricsAnalysis,
}

fn default_pix_fmt() -> String {
    CANONICAL_PIX_FMT.to_string()
}

/// One side (anchor or test) of a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideConfig {
    #[serde(default)]
    pub skip_encode: bool,
    pub source_dir: PathBuf,
    #[serde(default)]
    pub encoder: Option<EncoderKind>,
    #[serde(default)]
    pub encoder_params: Option<String>,
    #[serde(default)]
    pub rate_control: Option<RateControl>,
    #[serde(default)]
    pub bitrate_points: Vec<f64>,
    pub bitstream_dir: PathBuf,
    /// Pixel layout of raw sources on this side
    #[serde(default = "default_pix_fmt")]
    pub pixel_format: String,
}

impl SideConfig {
    fn validate(&self, side: &str) -> Result<(), AnalysisError> {
        let invalid = |msg: &str| AnalysisError::InvalidTemplate(format!("{side}: {msg}"));

        if self.source_dir.as_os_str().is_empty() {
            return Err(invalid("source_dir cannot be empty"));
        }
        if self.bitstream_dir.as_os_str().is_empty() {
            return Err(invalid("bitstream_dir cannot be empty"));
        }
        if self
            .bitrate_points
            .iter()
            .any(|p| !p.is_finite() || *p <= 0.0)
        {
            return Err(invalid("bitrate points must be positive numbers"));
        }
        // Existing bitstreams are located by point, so a side without points
        // would silently contribute nothing
        if self.bitrate_points.is_empty() {
            return Err(invalid("bitrate_points cannot be empty"));
        }
        if self.skip_encode {
            return Ok(());
        }

        if self.encoder.is_none() {
            return Err(invalid("encoder required when not skipping encode"));
        }
        if self
            .encoder_params
            .as_deref()
            .is_none_or(|p| p.trim().is_empty())
        {
            return Err(invalid("encoder_params required when not skipping encode"));
        }
        if self.rate_control.is_none() {
            return Err(invalid("rate_control required when not skipping encode"));
        }
        Ok(())
    }

    pub fn sorted_points(&self) -> Vec<f64> {
        let mut points = self.bitrate_points.clone();
        points.sort_by(f64::total_cmp);
        points
    }

    /// Short digest of the settings that determine this side's bitstreams
    pub fn fingerprint(&self) -> String {
        let points: Vec<String> = self.sorted_points().iter().map(f64::to_string).collect();
        let data = format!(
            "{}:{}:{}:[{}]",
            self.encoder.map(|e| e.as_str()).unwrap_or("none"),
            self.encoder_params.as_deref().unwrap_or(""),
            self.rate_control.map(|r| r.as_str()).unwrap_or("none"),
            points.join(",")
        );
        let digest = Sha256::digest(data.as_bytes());
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub kind: TemplateKind,
    pub anchor: SideConfig,
    #[serde(default)]
    pub test: Option<SideConfig>,
    /// Fail the run on the first per-pair error
    #[serde(default)]
    pub strict: bool,
}

impl Template {
    /// Read a template from a `.toml` or `.json` file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read template {}", path.display()))?;
        let template: Template = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse template {}", path.display()))?,
            _ => toml::from_str(&text)
                .with_context(|| format!("Failed to parse template {}", path.display()))?,
        };
        template.validate()?;
        Ok(template)
    }

    pub fn validate(&self) -> Result<(), AnalysisError> {
        if self.id.trim().is_empty() {
            return Err(AnalysisError::InvalidTemplate("id cannot be empty".into()));
        }
        self.anchor.validate("anchor")?;

        match (self.kind, &self.test) {
            (TemplateKind::Comparison, None) => Err(AnalysisError::InvalidTemplate(
                "comparison template requires a test side".into(),
            )),
            (TemplateKind::Comparison, Some(test)) => test.validate("test"),
            (TemplateKind::MetricsAnalysis, _) => Ok(()),
        }
    }

    /// The test side of a comparison template
    pub fn test_side(&self) -> Result<&SideConfig, AnalysisError> {
        self.test.as_ref().ok_or_else(|| {
            AnalysisError::InvalidTemplate("comparison template requires a test side".into())
        })
    }
}
