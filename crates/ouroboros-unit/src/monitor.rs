//! Resource monitoring for admission control
//!
//! The scheduler only asks one question: is the system strained right now?
//! [`SampledResourceMonitor`] answers it from a background task that samples
//! load and memory on an interval; [`NeverStrained`] always says no.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::EngineConfig;

/// Boolean strain signal used for backpressure
pub trait ResourceMonitor: Send + Sync {
    fn is_strained(&self) -> bool;
}

/// Monitor that never reports strain
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverStrained;

impl ResourceMonitor for NeverStrained {
    fn is_strained(&self) -> bool {
        false
    }
}

/// One reading of system load
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    /// 1-minute load average divided by logical cores
    pub load_per_core: Option<f64>,
    /// Fraction of physical memory in use
    pub memory_used: Option<f64>,
}

/// Source of resource samples
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Samples the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSampler;

impl ResourceSampler for SystemSampler {
    fn sample(&self) -> ResourceSample {
        ResourceSample {
            load_per_core: load_average().map(|load| load / num_cpus::get().max(1) as f64),
            memory_used: memory_used_fraction(),
        }
    }
}

#[cfg(unix)]
fn load_average() -> Option<f64> {
    let mut loads = [0f64; 3];
    let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    if n < 1 {
        return None;
    }
    Some(loads[0])
}

#[cfg(not(unix))]
fn load_average() -> Option<f64> {
    None
}

#[cfg(target_os = "linux")]
fn memory_used_fraction() -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&meminfo)
}

#[cfg(not(target_os = "linux"))]
fn memory_used_fraction() -> Option<f64> {
    None
}

/// Used fraction from `/proc/meminfo` text (MemTotal vs MemAvailable)
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo(text: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        text.lines()
            .find(|line| line.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total).clamp(0.0, 1.0))
}

/// Strain thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrainThresholds {
    pub load_per_core: f64,
    pub memory_used: f64,
}

impl StrainThresholds {
    pub fn is_strained(&self, sample: &ResourceSample) -> bool {
        sample.load_per_core.is_some_and(|l| l > self.load_per_core)
            || sample.memory_used.is_some_and(|m| m > self.memory_used)
    }
}

impl From<&EngineConfig> for StrainThresholds {
    fn from(config: &EngineConfig) -> Self {
        Self {
            load_per_core: config.cpu_strain_threshold,
            memory_used: config.memory_strain_threshold,
        }
    }
}

/// Monitor backed by a periodic sampling task
pub struct SampledResourceMonitor {
    strained: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl SampledResourceMonitor {
    /// Start sampling on the current tokio runtime
    pub fn start(
        sampler: Arc<dyn ResourceSampler>,
        thresholds: StrainThresholds,
        interval: Duration,
    ) -> Self {
        let strained = Arc::new(AtomicBool::new(thresholds.is_strained(&sampler.sample())));
        let shutdown = CancellationToken::new();

        let flag = strained.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        debug!("resource monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let sample = sampler.sample();
                        let now = thresholds.is_strained(&sample);
                        let before = flag.swap(now, Ordering::Relaxed);
                        if before != now {
                            debug!(strained = now, load = ?sample.load_per_core, memory = ?sample.memory_used, "strain changed");
                        } else {
                            trace!(strained = now, "resource sample");
                        }
                    }
                }
            }
        });

        Self { strained, shutdown }
    }

    /// Sample the operating system with thresholds from `config`
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::start(
            Arc::new(SystemSampler),
            StrainThresholds::from(config),
            config.resource_poll_interval(),
        )
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl ResourceMonitor for SampledResourceMonitor {
    fn is_strained(&self) -> bool {
        self.strained.load(Ordering::Relaxed)
    }
}

impl Drop for SampledResourceMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        strained: Arc<AtomicBool>,
    }

    impl ResourceSampler for Scripted {
        fn sample(&self) -> ResourceSample {
            let load = if self.strained.load(Ordering::SeqCst) { 4.0 } else { 0.1 };
            ResourceSample {
                load_per_core: Some(load),
                memory_used: None,
            }
        }
    }

    #[test]
    fn test_parse_meminfo() {
        let text = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        assert_eq!(parse_meminfo(text), Some(0.75));
        assert_eq!(parse_meminfo("garbage"), None);
    }

    #[test]
    fn test_thresholds() {
        let thresholds = StrainThresholds {
            load_per_core: 0.9,
            memory_used: 0.9,
        };
        let calm = ResourceSample {
            load_per_core: Some(0.2),
            memory_used: Some(0.5),
        };
        let busy = ResourceSample {
            load_per_core: Some(0.2),
            memory_used: Some(0.95),
        };
        let unknown = ResourceSample {
            load_per_core: None,
            memory_used: None,
        };
        assert!(!thresholds.is_strained(&calm));
        assert!(thresholds.is_strained(&busy));
        assert!(!thresholds.is_strained(&unknown));
    }

    #[tokio::test]
    async fn test_sampled_monitor_follows_sampler() {
        let switch = Arc::new(AtomicBool::new(false));
        let monitor = SampledResourceMonitor::start(
            Arc::new(Scripted {
                strained: switch.clone(),
            }),
            StrainThresholds {
                load_per_core: 0.9,
                memory_used: 0.9,
            },
            Duration::from_millis(5),
        );
        assert!(!monitor.is_strained());

        switch.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.is_strained());
        monitor.stop();
    }

    #[test]
    fn test_never_strained() {
        assert!(!NeverStrained.is_strained());
    }
}
