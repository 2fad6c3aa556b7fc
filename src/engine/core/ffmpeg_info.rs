use anyhow::{Context, Result};
use std::path::Path;
use std::process::Command;

use super::context::Toolchain;

fn first_line_of_version(program: &Path, flag: &str) -> Result<String> {
    let output = Command::new(program)
        .arg(flag)
        .output()
        .with_context(|| {
            format!(
                "Failed to execute {}. Is it installed and in PATH?",
                program.display()
            )
        })?;

    if !output.status.success() {
        anyhow::bail!(
            "{} {} failed with status: {}",
            program.display(),
            flag,
            output.status
        );
    }

    // x265 and vvencapp print their banner on stderr
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let text = if stdout.trim().is_empty() { stderr } else { stdout };
    Ok(first_line(&text))
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("Unknown version")
        .to_string()
}

/// Check if ffmpeg is available and return its version
pub fn ffmpeg_version(toolchain: &Toolchain) -> Result<String> {
    first_line_of_version(&toolchain.ffmpeg, "-version")
}

/// Check if ffprobe is available
pub fn ffprobe_version(toolchain: &Toolchain) -> Result<String> {
    first_line_of_version(&toolchain.ffprobe, "-version")
}

/// Version banner of a standalone encoder binary
pub fn encoder_version(program: &Path) -> Result<String> {
    first_line_of_version(program, "--version")
}

/// Check if ffmpeg has the libvmaf filter available
pub fn vmaf_filter_available(toolchain: &Toolchain) -> bool {
    let output = Command::new(&toolchain.ffmpeg)
        .arg("-hide_banner")
        .arg("-filters")
        .output();

    match output {
        Ok(out) if out.status.success() => filters_list_has_libvmaf(&String::from_utf8_lossy(&out.stdout)),
        _ => false,
    }
}

fn filters_list_has_libvmaf(listing: &str) -> bool {
    listing
        .lines()
        .any(|l| l.split_whitespace().nth(1) == Some("libvmaf"))
}
