//! Filter and scenario configuration.
//!
//! Both configuration types are plain serde structs with every field defaulted, so a file only
//! needs to name the values it changes. They can be written and read as JSON, YAML or TOML; the
//! generic [`ConfigFile::to_file`] / [`ConfigFile::from_file`] pick the format from the file
//! extension.
//!
//! ```toml
//! num_steps = 600
//! observation_interval = 3
//!
//! [filter]
//! num_particles = 1000
//! estimation_strategy = "mean"
//! ```
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::particle::ParticleAveragingStrategy;

/// Load/store helpers shared by all configuration types.
pub trait ConfigFile: Serialize + DeserializeOwned {
    /// Write the configuration to a JSON file (pretty-printed).
    fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    /// Read the configuration from a JSON file.
    fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }

    fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }

    fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }

    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported_extension(p)),
        }
    }

    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(unsupported_extension(p)),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported_extension(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!(
            "unsupported config extension for '{}' (expected .json, .yaml, .yml or .toml)",
            path.display()
        ),
    )
}

/// Particle filter parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Number of particles N, fixed for the filter's lifetime.
    pub num_particles: usize,
    /// Radius R of the initial position spread around the start pose (m).
    pub position_range_m: f64,
    /// Half-range A of the initial heading spread (rad).
    pub angle_range_rad: f64,
    /// Variance σ² of a detected pole position (m²).
    pub landmark_variance: f64,
    /// Resample when the normalized effective sample size drops below this.
    pub min_neff: f64,
    pub estimation_strategy: ParticleAveragingStrategy,
    /// Constant added to each per-detection density.
    pub likelihood_floor: f64,
    /// Share of highest-weight particles averaged by the `best` estimator.
    pub best_fraction: f64,
    /// Density p_min defining the detection clipping distance.
    pub min_density: f64,
    /// Reference pose `T_w_o` as `[x, y, phi]`; estimates are averaged in its frame.
    pub reference_pose: [f64; 3],
    pub seed: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            num_particles: 2000,
            position_range_m: 3.0,
            angle_range_rad: 5.0_f64.to_radians(),
            landmark_variance: 1.0,
            min_neff: 0.5,
            estimation_strategy: ParticleAveragingStrategy::default(),
            likelihood_floor: 0.1,
            best_fraction: 0.1,
            min_density: 0.01,
            reference_pose: [0.0, 0.0, 0.0],
            seed: 42,
        }
    }
}

impl ConfigFile for FilterConfig {}

/// Synthetic localization run: trajectory, pole map, sensor noise and the filter to run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub num_steps: usize,
    /// Distance travelled per step (m).
    pub step_length_m: f64,
    /// Peak heading change per step (rad); the turn rate follows a sine over `turn_period_steps`.
    pub turn_rate_rad: f64,
    pub turn_period_steps: usize,
    /// Spacing of poles along the path (m).
    pub landmark_spacing_m: f64,
    /// Lateral offset of the pole rows on either side of the path (m).
    pub landmark_offset_m: f64,
    /// Poles are observed every this many steps.
    pub observation_interval: usize,
    pub observation_range_m: f64,
    pub observation_noise_std_m: f64,
    /// Odometry standard deviation as a fraction of each motion component.
    pub odometry_noise_fraction: f64,
    /// Standard deviation added to every odometry component `[x (m), y (m), phi (rad)]`.
    pub odometry_min_std: [f64; 3],
    pub seed: u64,
    pub filter: FilterConfig,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            num_steps: 400,
            step_length_m: 1.0,
            turn_rate_rad: 0.02,
            turn_period_steps: 200,
            landmark_spacing_m: 8.0,
            landmark_offset_m: 6.0,
            observation_interval: 5,
            observation_range_m: 25.0,
            observation_noise_std_m: 0.1,
            odometry_noise_fraction: 0.02,
            odometry_min_std: [0.01, 0.01, 0.001],
            seed: 7,
            filter: FilterConfig::default(),
        }
    }
}

impl ConfigFile for ScenarioConfig {}
