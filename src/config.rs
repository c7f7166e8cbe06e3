use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::dsp::{FilterOrder, FilterSpec};
use crate::error::{Error, Result};

/// Experiment configuration, read from `config.toml`. Defaults reproduce the
/// six-condition telephone-bandwidth comparison the tool was written for.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExperimentConfig {
    /// Source recording all stimulus variants are derived from.
    #[serde(default = "default_source_file")]
    pub source_file: PathBuf,
    /// Peak amplitude of the reference variant, as a fraction of full scale.
    #[serde(default = "default_target_peak")]
    pub target_peak: f32,
    /// Silence after each stimulus, in seconds. Must exceed the stimulus
    /// duration so A and B never overlap.
    #[serde(default = "default_gap_secs")]
    pub gap_secs: f64,
    /// Onset/offset ramp applied to every variant, in milliseconds.
    /// 0 disables tapering.
    #[serde(default = "default_taper_ms")]
    pub taper_ms: u32,
    /// Persisted session schedule.
    #[serde(default = "default_session_file")]
    pub session_file: PathBuf,
    /// Directory the timestamped results CSV is created in.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Number of variants presented in a pilot run (indices are spread over
    /// the full set).
    #[serde(default = "default_pilot_count")]
    pub pilot_count: u32,
    /// One entry per stimulus variant, in presentation-index order.
    #[serde(default = "default_stimuli")]
    pub stimuli: Vec<FilterSpec>,
}

fn default_source_file() -> PathBuf {
    PathBuf::from("02AuraLee3.mp3")
}

fn default_target_peak() -> f32 {
    0.75
}

fn default_gap_secs() -> f64 {
    8.0
}

fn default_taper_ms() -> u32 {
    50
}

fn default_session_file() -> PathBuf {
    PathBuf::from("session.csv")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_pilot_count() -> u32 {
    3
}

fn default_stimuli() -> Vec<FilterSpec> {
    vec![
        FilterSpec::Source,
        FilterSpec::Lowpass {
            cutoff_hz: 15_000.0,
            order: FilterOrder::Fixed(8),
        },
        FilterSpec::Lowpass {
            cutoff_hz: 8_000.0,
            order: FilterOrder::Fixed(8),
        },
        FilterSpec::Lowpass {
            cutoff_hz: 3_400.0,
            order: FilterOrder::Fixed(4),
        },
        FilterSpec::Band {
            low_hz: 300.0,
            high_hz: 3_400.0,
            order: FilterOrder::Fixed(4),
        },
        FilterSpec::Band {
            low_hz: 1_000.0,
            high_hz: 3_400.0,
            order: FilterOrder::Fixed(4),
        },
    ]
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            source_file: default_source_file(),
            target_peak: default_target_peak(),
            gap_secs: default_gap_secs(),
            taper_ms: default_taper_ms(),
            session_file: default_session_file(),
            results_dir: default_results_dir(),
            pilot_count: default_pilot_count(),
            stimuli: default_stimuli(),
        }
    }
}

impl ExperimentConfig {
    /// Load from `path`; a missing file yields the defaults, a malformed one
    /// is an error.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(txt) => {
                let cfg: ExperimentConfig = toml::from_str(&txt)
                    .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
                cfg.validate()?;
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn generate_default(path: &Path) -> Result<()> {
        let txt = toml::to_string_pretty(&Self::default())
            .map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, txt)?;
        Ok(())
    }

    pub fn stimulus_count(&self) -> u32 {
        self.stimuli.len() as u32
    }

    fn validate(&self) -> Result<()> {
        if self.stimuli.len() < 2 {
            return Err(Error::Config(format!(
                "need at least 2 stimulus variants, got {}",
                self.stimuli.len()
            )));
        }
        if self.pilot_count < 2 || self.pilot_count as usize > self.stimuli.len() {
            return Err(Error::Config(format!(
                "pilot_count {} outside 2..={}",
                self.pilot_count,
                self.stimuli.len()
            )));
        }
        if !(0.0..=1.0).contains(&self.target_peak) {
            return Err(Error::Config(format!(
                "target_peak {} outside 0..=1",
                self.target_peak
            )));
        }
        if self.gap_secs < 0.0 {
            return Err(Error::Config("gap_secs must be non-negative".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_reproduce_the_six_conditions() {
        let cfg = ExperimentConfig::default();
        assert_eq!(cfg.stimulus_count(), 6);
        assert_eq!(cfg.stimuli[0], FilterSpec::Source);
        assert_eq!(
            cfg.stimuli[3],
            FilterSpec::Lowpass {
                cutoff_hz: 3_400.0,
                order: FilterOrder::Fixed(4)
            }
        );
        assert_eq!(
            cfg.stimuli[4],
            FilterSpec::Band {
                low_hz: 300.0,
                high_hz: 3_400.0,
                order: FilterOrder::Fixed(4)
            }
        );
        assert!((cfg.target_peak - 0.75).abs() < f32::EPSILON);
        assert!((cfg.gap_secs - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn roundtrips_through_toml() {
        let cfg = ExperimentConfig::default();
        let txt = toml::to_string_pretty(&cfg).unwrap();
        let back: ExperimentConfig = toml::from_str(&txt).unwrap();
        assert_eq!(back.stimuli, cfg.stimuli);
        assert_eq!(back.session_file, cfg.session_file);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: ExperimentConfig = toml::from_str("gap_secs = 2.5\n").unwrap();
        assert!((cfg.gap_secs - 2.5).abs() < f64::EPSILON);
        assert_eq!(cfg.stimulus_count(), 6);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = ExperimentConfig::default();
        cfg.pilot_count = 1;
        assert!(cfg.validate().is_err());
        let mut cfg = ExperimentConfig::default();
        cfg.target_peak = 1.5;
        assert!(cfg.validate().is_err());
        let mut cfg = ExperimentConfig::default();
        cfg.stimuli.truncate(1);
        assert!(cfg.validate().is_err());
    }
}
