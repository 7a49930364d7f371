//! # Module: control_file
//!
//! ## Responsibility
//! The optional control-file collaborator interface: a TOML
//! document describing the running optimization profile, read and updated
//! atomically by out-of-process collaborators and by this crate.
//!
//! The general Rust write-temp-then-rename idiom for atomic file updates,
//! deliberately not adding an flock crate since create-exclusive semantics
//! are sufficient for an advisory lock.
//!
//! ## NOT Responsible For
//! Deciding what a processor *does* in response to `optimization_profile` —
//! that's Governance/the processors themselves once a patch reaches them.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{PhoenixError, PhoenixResult};
use crate::util::smoothed::SmoothedSeries;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationProfile {
    Conservative,
    Balanced,
    Aggressive,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CurrentMetrics {
    pub full_ts: f64,
    pub optimized_ts: f64,
    pub experimental_ts: f64,
    pub cost_reduction_ratio: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileThresholds {
    pub conservative_max_ts: f64,
    pub aggressive_min_ts: f64,
}

fn profile_rank(p: OptimizationProfile) -> u8 {
    match p {
        OptimizationProfile::Conservative => 0,
        OptimizationProfile::Balanced => 1,
        OptimizationProfile::Aggressive => 2,
    }
}

/// Drives `optimization_profile` off the Adaptive Controller's effective
/// output magnitude relative to `thresholds.conservative_max_ts` /
/// `thresholds.aggressive_min_ts`, with the same escalate-immediately /
/// de-escalate-only-after-a-sustained-recovery-window asymmetry
/// [`crate::safety::SafetyMonitor`] uses for its own levels — one hysteresis
/// policy in the codebase, generalized, rather than two.
pub struct ProfileHysteresis {
    history: SmoothedSeries,
    recovery_ticks: usize,
}

impl ProfileHysteresis {
    /// `recovery_ticks` is the number of consecutive control-loop ticks a
    /// reading must hold inside the less-aggressive band before
    /// de-escalation fires; also doubles as the smoothing window size.
    pub fn new(recovery_ticks: usize) -> Self {
        let recovery_ticks = recovery_ticks.max(1);
        Self {
            history: SmoothedSeries::new(recovery_ticks, 0.3),
            recovery_ticks,
        }
    }

    fn band_for(magnitude: f64, thresholds: &ProfileThresholds) -> OptimizationProfile {
        if magnitude >= thresholds.aggressive_min_ts {
            OptimizationProfile::Aggressive
        } else if magnitude <= thresholds.conservative_max_ts {
            OptimizationProfile::Conservative
        } else {
            OptimizationProfile::Balanced
        }
    }

    /// Feed one magnitude reading and return the profile that should be in
    /// effect after it. Escalation (toward `Aggressive`) applies as soon as
    /// the smoothed reading crosses into a more-aggressive band; de-
    /// escalation only applies once every sample in a full `recovery_ticks`
    /// window sits inside the less-aggressive band.
    pub fn next_profile(
        &mut self,
        current: OptimizationProfile,
        magnitude: f64,
        thresholds: &ProfileThresholds,
    ) -> OptimizationProfile {
        self.history.push(magnitude);
        let smoothed = self.history.ewma().unwrap_or(magnitude);
        let candidate = Self::band_for(smoothed, thresholds);

        match profile_rank(candidate).cmp(&profile_rank(current)) {
            std::cmp::Ordering::Greater => candidate,
            std::cmp::Ordering::Equal => current,
            std::cmp::Ordering::Less => {
                let sustained = self.history.len() >= self.recovery_ticks
                    && self
                        .history
                        .all_recent_satisfy(self.recovery_ticks, |v| Self::band_for(v, thresholds) <= candidate);
                if sustained {
                    candidate
                } else {
                    current
                }
            }
        }
    }
}

impl PartialOrd for OptimizationProfile {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(profile_rank(*self).cmp(&profile_rank(*other)))
    }
}

impl Ord for OptimizationProfile {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        profile_rank(*self).cmp(&profile_rank(*other))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineToggles {
    pub full_fidelity_enabled: bool,
    pub optimized_enabled: bool,
    pub experimental_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlFile {
    pub optimization_profile: OptimizationProfile,
    pub last_updated: u64,
    pub trigger_reason: String,
    pub current_metrics: CurrentMetrics,
    pub config_version: u64,
    pub correlation_id: String,
    pub last_profile_change_timestamp: u64,
    pub thresholds: ProfileThresholds,
    pub pipelines: PipelineToggles,
}

impl Default for ControlFile {
    fn default() -> Self {
        Self {
            optimization_profile: OptimizationProfile::Balanced,
            last_updated: 0,
            trigger_reason: "initial".to_string(),
            current_metrics: CurrentMetrics::default(),
            config_version: 1,
            correlation_id: String::new(),
            last_profile_change_timestamp: 0,
            thresholds: ProfileThresholds::default(),
            pipelines: PipelineToggles {
                full_fidelity_enabled: true,
                optimized_enabled: false,
                experimental_enabled: false,
            },
        }
    }
}

fn lock_path(path: &Path) -> std::path::PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".lock");
    std::path::PathBuf::from(p)
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(format!(".tmp-{}", std::process::id()));
    std::path::PathBuf::from(p)
}

/// Acquire an advisory exclusive lock by creating `{path}.lock`, run `f`,
/// then always remove the lock file. Returns `Transient` if another writer
/// currently holds the lock.
fn with_lock<T>(path: &Path, f: impl FnOnce() -> PhoenixResult<T>) -> PhoenixResult<T> {
    let lock = lock_path(path);
    let _file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&lock)
        .map_err(|e| PhoenixError::Transient(format!("control file locked ({lock:?}): {e}")))?;

    let result = f();
    let _ = fs::remove_file(&lock);
    result
}

pub fn read(path: &Path) -> PhoenixResult<ControlFile> {
    let contents = fs::read_to_string(path)
        .map_err(|e| PhoenixError::ConfigInvalid(format!("reading control file {path:?}: {e}")))?;
    toml::from_str(&contents).map_err(|e| PhoenixError::ConfigInvalid(format!("parsing control file {path:?}: {e}")))
}

/// Atomically update the control file: write to a pid-suffixed temp file,
/// flush, `rename` onto `path`. Guarded by an advisory `{path}.lock` file so
/// concurrent writers serialize rather than interleave.
pub fn update(path: &Path, f: impl FnOnce(&mut ControlFile)) -> PhoenixResult<ControlFile> {
    with_lock(path, || {
        let mut doc = if path.exists() {
            read(path)?
        } else {
            ControlFile::default()
        };
        f(&mut doc);
        doc.last_updated = unix_now();

        let toml_text = toml::to_string_pretty(&doc)
            .map_err(|e| PhoenixError::Fatal(format!("serializing control file: {e}")))?;

        let tmp = tmp_path(path);
        {
            let mut file = File::create(&tmp)
                .map_err(|e| PhoenixError::Transient(format!("creating temp control file {tmp:?}: {e}")))?;
            file.write_all(toml_text.as_bytes())
                .map_err(|e| PhoenixError::Transient(format!("writing temp control file {tmp:?}: {e}")))?;
            file.sync_all()
                .map_err(|e| PhoenixError::Transient(format!("fsync temp control file {tmp:?}: {e}")))?;
        }
        fs::rename(&tmp, path)
            .map_err(|e| PhoenixError::Transient(format!("renaming control file into place {path:?}: {e}")))?;

        Ok(doc)
    })
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn update_creates_file_with_defaults_when_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("control.toml");
        let doc = update(&path, |doc| {
            doc.trigger_reason = "startup".to_string();
        })
        .unwrap();
        assert_eq!(doc.trigger_reason, "startup");
        assert!(path.exists());
        assert!(!lock_path(&path).exists());
    }

    #[test]
    fn update_round_trips_through_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("control.toml");
        update(&path, |doc| {
            doc.optimization_profile = OptimizationProfile::Aggressive;
            doc.config_version = 7;
        })
        .unwrap();

        let reread = read(&path).unwrap();
        assert_eq!(reread.optimization_profile, OptimizationProfile::Aggressive);
        assert_eq!(reread.config_version, 7);
    }

    #[test]
    fn update_leaves_no_temp_file_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("control.toml");
        update(&path, |_| {}).unwrap();
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn stale_lock_file_blocks_update_until_removed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("control.toml");
        let lock = lock_path(&path);
        File::create(&lock).unwrap();

        assert!(matches!(update(&path, |_| {}), Err(PhoenixError::Transient(_))));

        fs::remove_file(&lock).unwrap();
        assert!(update(&path, |_| {}).is_ok());
    }

    fn thresholds() -> ProfileThresholds {
        ProfileThresholds {
            conservative_max_ts: 100.0,
            aggressive_min_ts: 1000.0,
        }
    }

    #[test]
    fn escalates_immediately_on_high_magnitude() {
        let mut h = ProfileHysteresis::new(3);
        let next = h.next_profile(OptimizationProfile::Balanced, 2000.0, &thresholds());
        assert_eq!(next, OptimizationProfile::Aggressive);
    }

    #[test]
    fn deescalation_requires_a_sustained_recovery_window() {
        let mut h = ProfileHysteresis::new(2);
        let t = thresholds();
        let mut profile = OptimizationProfile::Aggressive;

        profile = h.next_profile(profile, 80.0, &t);
        assert_eq!(profile, OptimizationProfile::Aggressive, "one low reading isn't a full window yet");

        profile = h.next_profile(profile, 80.0, &t);
        assert_eq!(profile, OptimizationProfile::Conservative, "two consecutive low readings fill the window");
    }

    #[test]
    fn deescalation_resets_on_a_later_spike() {
        let mut h = ProfileHysteresis::new(2);
        let t = thresholds();
        let mut profile = OptimizationProfile::Aggressive;

        profile = h.next_profile(profile, 80.0, &t);
        profile = h.next_profile(profile, 2000.0, &t); // spike, stays aggressive and breaks the window
        assert_eq!(profile, OptimizationProfile::Aggressive);

        profile = h.next_profile(profile, 80.0, &t);
        assert_eq!(profile, OptimizationProfile::Aggressive, "window still has the spike in it");

        // Enough further low readings for the EWMA to shed the spike's
        // influence and the window to fill with recovered samples.
        for _ in 0..10 {
            profile = h.next_profile(profile, 80.0, &t);
        }
        assert_eq!(profile, OptimizationProfile::Conservative);
    }

    #[test]
    fn update_control_file_records_optimization_profile_and_metrics() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("control.toml");
        let mut h = ProfileHysteresis::new(1);
        let t = thresholds();

        update(&path, |doc| {
            doc.optimization_profile = h.next_profile(doc.optimization_profile, 2000.0, &t);
            doc.thresholds = t.clone();
            doc.current_metrics.full_ts = 2000.0;
        })
        .unwrap();

        let reread = read(&path).unwrap();
        assert_eq!(reread.optimization_profile, OptimizationProfile::Aggressive);
        assert_eq!(reread.current_metrics.full_ts, 2000.0);
    }
}
