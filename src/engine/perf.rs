// Encoder performance: CPU sampling of a process tree and host description

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use sysinfo::{Pid, System};
use tracing::debug;

use super::core::PerformanceSample;

/// Samples the CPU usage of a process and all of its descendants on a
/// companion thread.
///
/// Each sample is the summed usage of the tree divided by the logical core
/// count, so 100.0 means every core busy. The first reading only primes the
/// counters and is dropped. Sampling ends on [`stop`](Self::stop), on drop,
/// or when the root process disappears.
#[derive(Debug)]
pub struct CpuSampler {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<Vec<f64>>>,
}

impl CpuSampler {
    pub fn start(pid: u32, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            let root = Pid::from_u32(pid);
            let mut sys = System::new();
            sys.refresh_cpu();
            let cores = sys.cpus().len().max(1) as f64;

            // Warm-up: process usage is only meaningful from the second refresh
            sys.refresh_processes();
            let mut samples = Vec::new();

            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }

                sys.refresh_processes();
                if sys.process(root).is_none() {
                    debug!(pid, samples = samples.len(), "sampled process exited");
                    break;
                }

                let tree: Vec<(u32, Option<u32>, f64)> = sys
                    .processes()
                    .iter()
                    .map(|(pid, p)| {
                        (
                            pid.as_u32(),
                            p.parent().map(|parent| parent.as_u32()),
                            f64::from(p.cpu_usage()),
                        )
                    })
                    .collect();
                samples.push(tree_cpu_usage(&tree, pid) / cores);
            }
            samples
        });

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Stop sampling and return what was collected
    pub fn stop(mut self) -> Vec<f64> {
        self.finish()
    }

    fn finish(&mut self) -> Vec<f64> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        self.handle
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default()
    }
}

impl Drop for CpuSampler {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Summed usage of `root` and every descendant in a `(pid, parent, usage)` table
pub fn tree_cpu_usage(table: &[(u32, Option<u32>, f64)], root: u32) -> f64 {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    let mut usage: HashMap<u32, f64> = HashMap::new();
    for &(pid, parent, cpu) in table {
        usage.insert(pid, cpu);
        if let Some(parent) = parent {
            children.entry(parent).or_default().push(pid);
        }
    }

    let mut total = 0.0;
    let mut stack = vec![root];
    let mut seen = std::collections::HashSet::new();
    while let Some(pid) = stack.pop() {
        if !seen.insert(pid) {
            continue;
        }
        total += usage.get(&pid).copied().unwrap_or(0.0);
        if let Some(kids) = children.get(&pid) {
            stack.extend(kids);
        }
    }
    total
}

/// Frames, fps and time reported by an encoder on completion
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EncoderSummary {
    pub frames: Option<u64>,
    pub fps: Option<f64>,
    pub elapsed_s: Option<f64>,
}

/// Combine an encoder summary, the wall-clock time and CPU samples
pub fn performance_sample(
    summary: EncoderSummary,
    wall_clock: Duration,
    cpu_samples: Vec<f64>,
) -> PerformanceSample {
    let fps = summary.fps.filter(|f| *f > 0.0);

    let total_encoding_time_s = summary
        .elapsed_s
        .or_else(|| match (summary.frames, fps) {
            (Some(frames), Some(fps)) if frames > 0 => Some(frames as f64 / fps),
            _ => None,
        })
        .unwrap_or_else(|| wall_clock.as_secs_f64());

    let (cpu_avg_percent, cpu_max_percent) = if cpu_samples.is_empty() {
        (None, None)
    } else {
        let avg = cpu_samples.iter().sum::<f64>() / cpu_samples.len() as f64;
        let max = cpu_samples.iter().copied().fold(f64::MIN, f64::max);
        (Some(avg), Some(max))
    };

    PerformanceSample {
        encoding_fps: fps,
        avg_frame_time_ms: fps.map(|f| 1000.0 / f),
        total_encoding_time_s: Some(total_encoding_time_s),
        total_frames: summary.frames,
        cpu_avg_percent,
        cpu_max_percent,
        cpu_samples,
    }
}

/// Host description attached to reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub captured_at: DateTime<Local>,
    pub os: String,
    pub os_version: String,
    pub cpu_arch: String,
    pub cpu_model: String,
    pub physical_cores: Option<usize>,
    pub logical_cores: usize,
    pub total_memory_bytes: u64,
}

impl EnvironmentInfo {
    pub fn capture() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();

        let cpu_model = sys
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| "Unknown".to_string());

        Self {
            captured_at: Local::now(),
            os: System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            os_version: System::os_version().unwrap_or_default(),
            cpu_arch: std::env::consts::ARCH.to_string(),
            cpu_model,
            physical_cores: sys.physical_core_count(),
            logical_cores: sys.cpus().len(),
            total_memory_bytes: sys.total_memory(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_usage_includes_descendants_only() {
        let table = [
            (1, None, 5.0),
            (10, Some(1), 100.0),
            (11, Some(10), 250.0),
            (12, Some(10), 50.0),
            (20, Some(1), 75.0),
        ];
        assert_eq!(tree_cpu_usage(&table, 10), 400.0);
        assert_eq!(tree_cpu_usage(&table, 20), 75.0);
        assert_eq!(tree_cpu_usage(&table, 99), 0.0);
    }

    #[test]
    fn tree_usage_survives_parent_cycles() {
        let table = [(1, Some(2), 10.0), (2, Some(1), 20.0)];
        assert_eq!(tree_cpu_usage(&table, 1), 30.0);
    }

    #[test]
    fn sample_from_reported_summary() {
        let summary = EncoderSummary {
            frames: Some(300),
            fps: Some(60.0),
            elapsed_s: None,
        };
        let perf = performance_sample(summary, Duration::from_secs(9), vec![40.0, 80.0]);
        assert_eq!(perf.encoding_fps, Some(60.0));
        assert!((perf.avg_frame_time_ms.unwrap() - 16.666).abs() < 0.01);
        assert_eq!(perf.total_encoding_time_s, Some(5.0));
        assert_eq!(perf.total_frames, Some(300));
        assert_eq!(perf.cpu_avg_percent, Some(60.0));
        assert_eq!(perf.cpu_max_percent, Some(80.0));
    }

    #[test]
    fn wall_clock_fallback() {
        let perf = performance_sample(EncoderSummary::default(), Duration::from_millis(1500), vec![]);
        assert_eq!(perf.total_encoding_time_s, Some(1.5));
        assert_eq!(perf.encoding_fps, None);
        assert_eq!(perf.cpu_avg_percent, None);
        assert!(perf.cpu_samples.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn sampler_stops_when_process_exits() {
        let mut child = std::process::Command::new("sleep").arg("0.3").spawn().unwrap();
        let sampler = CpuSampler::start(child.id(), Duration::from_millis(20));
        child.wait().unwrap();
        let samples = sampler.stop();
        assert!(samples.iter().all(|s| s.is_finite() && *s >= 0.0));
    }

    #[test]
    fn environment_is_populated() {
        let env = EnvironmentInfo::capture();
        assert!(!env.cpu_arch.is_empty());
        assert!(!env.os.is_empty());
    }
}
