//! Localization runs: the per-step driver, a synthetic pole scenario and error statistics.
//!
//! A run is a sequence of [`LocalizationStep`]s, each carrying the odometry since the previous
//! step and, on some steps, the poles detected at the new pose. [`run_localization`] feeds them
//! through any [`LocalizationFilter`] and records one pose estimate per step.
use std::f64::consts::PI;
use std::fmt::{self, Display};
use std::io;
use std::path::Path;

use log::{debug, info, trace};
use nalgebra::{Matrix3, Vector2, Vector3};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::config::ScenarioConfig;
use crate::error::{FilterError, Result};
use crate::landmarks::{Landmark, LandmarkMap};
use crate::linalg::{covariance_sqrt, sample_gaussian};
use crate::measurements::PoleObservation;
use crate::particle::ParticleFilter;
use crate::pose::{Pose, compose, invert, pose_to_xyp, transform_point, wrap_angle, xyp_to_pose};
use crate::{LocalizationFilter, MotionSample};

/// Inputs for one time step.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalizationStep {
    pub motion: MotionSample,
    /// Poles detected after the motion, in the vehicle frame. `None` when no local map was
    /// available at this step.
    pub observations: Option<PoleObservation>,
}

/// One CSV row of a [`LocalizationResult`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimateRecord {
    pub step: usize,
    pub x: f64,
    pub y: f64,
    /// Heading in radians.
    pub phi: f64,
}

/// Pose estimates of a run: index 0 is the initial belief, index `k` the estimate after step `k`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalizationResult {
    pub estimates: Vec<Pose>,
    /// Number of steps on which the measurement update resampled.
    pub resample_count: usize,
}

impl LocalizationResult {
    /// Write the estimates as `step,x,y,phi` rows.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for (step, pose) in self.estimates.iter().enumerate() {
            let xyp = pose_to_xyp(pose);
            writer.serialize(EstimateRecord {
                step,
                x: xyp[0],
                y: xyp[1],
                phi: xyp[2],
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read estimates previously written by [`LocalizationResult::to_csv`].
    ///
    /// The resample count is not stored and reads back as zero.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut estimates = Vec::new();
        for record in reader.deserialize() {
            let record: EstimateRecord = record?;
            estimates.push(xyp_to_pose(&Vector3::new(record.x, record.y, record.phi)));
        }
        Ok(LocalizationResult {
            estimates,
            resample_count: 0,
        })
    }
}

/// Drive a filter through a sequence of steps.
///
/// Records the estimate of the initial belief, then for every step applies the motion update and
/// records the estimate. When the step carries observations the measurement update follows and
/// its estimate replaces the one recorded for the step.
pub fn run_localization<F: LocalizationFilter>(
    filter: &mut F,
    steps: &[LocalizationStep],
) -> LocalizationResult {
    let mut result = LocalizationResult {
        estimates: Vec::with_capacity(steps.len() + 1),
        resample_count: 0,
    };
    result.estimates.push(filter.estimate());

    for (k, step) in steps.iter().enumerate() {
        filter.predict(&step.motion);
        let mut estimate = filter.estimate();
        if let Some(observation) = &step.observations {
            if filter.update(observation) {
                result.resample_count += 1;
            }
            estimate = filter.estimate();
        }
        trace!("step {}: estimate {:?}", k + 1, pose_to_xyp(&estimate).as_slice());
        result.estimates.push(estimate);
    }
    debug!(
        "localization finished: {} steps, {} resampling events",
        steps.len(),
        result.resample_count
    );
    result
}

/// Synthetic localization problem: a ground truth trajectory, the poles lining it and the
/// noisy odometry and detections a vehicle would have produced along it.
#[derive(Clone, Debug)]
pub struct Scenario {
    /// True poses, `num_steps + 1` of them starting at the origin.
    pub truth: Vec<Pose>,
    pub map: LandmarkMap,
    pub steps: Vec<LocalizationStep>,
}

impl Scenario {
    /// Generate a scenario from its configuration; the same configuration always yields the
    /// same scenario.
    ///
    /// The vehicle drives at constant speed while its turn rate follows a sine over
    /// `turn_period_steps`. A pair of poles, one on each side at `landmark_offset_m`, is placed
    /// every `landmark_spacing_m` of travel. Odometry is the true relative motion perturbed by
    /// zero-mean noise with per-component standard deviation
    /// `odometry_noise_fraction * |delta| + odometry_min_std`, and is reported with that
    /// covariance. Every `observation_interval` steps all poles within `observation_range_m`
    /// are detected in the vehicle frame with isotropic noise.
    pub fn generate(config: &ScenarioConfig) -> Result<Self> {
        validate(config)?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let detection_noise = Normal::new(0.0, config.observation_noise_std_m)
            .map_err(|e| FilterError::InvalidConfig(e.to_string()))?;

        let mut truth = Vec::with_capacity(config.num_steps + 1);
        let mut deltas = Vec::with_capacity(config.num_steps);
        let mut landmarks = Vec::new();
        let mut pose = Pose::identity();
        let mut travelled = 0.0;
        let mut next_pole = 0.0;
        truth.push(pose);
        for k in 0..=config.num_steps {
            while travelled >= next_pole {
                for side in [1.0, -1.0] {
                    let p = transform_point(&pose, &Vector2::new(0.0, side * config.landmark_offset_m));
                    landmarks.push(Landmark::new(p.x, p.y));
                }
                next_pole += config.landmark_spacing_m;
            }
            if k == config.num_steps {
                break;
            }
            let turn = if config.turn_period_steps > 0 {
                config.turn_rate_rad * (2.0 * PI * k as f64 / config.turn_period_steps as f64).sin()
            } else {
                config.turn_rate_rad
            };
            let delta = Vector3::new(config.step_length_m, 0.0, turn);
            pose = compose(&pose, &xyp_to_pose(&delta));
            travelled += config.step_length_m;
            truth.push(pose);
            deltas.push(delta);
        }
        let map = LandmarkMap::new(landmarks);

        let min_std = Vector3::from(config.odometry_min_std);
        let mut steps = Vec::with_capacity(config.num_steps);
        for (k, delta) in deltas.iter().enumerate() {
            let std = delta.abs() * config.odometry_noise_fraction + min_std;
            let covariance = Matrix3::from_diagonal(&std.component_mul(&std));
            let measured = sample_gaussian(delta, &covariance_sqrt(&covariance), &mut rng);

            let observations = if config.observation_interval > 0
                && (k + 1) % config.observation_interval == 0
            {
                let at = &truth[k + 1];
                let to_vehicle = invert(at);
                let positions = map
                    .positions()
                    .filter(|p| (*p - at.translation.vector).norm() <= config.observation_range_m)
                    .map(|p| {
                        let local = transform_point(&to_vehicle, p);
                        local
                            + Vector2::new(
                                detection_noise.sample(&mut rng),
                                detection_noise.sample(&mut rng),
                            )
                    })
                    .collect();
                Some(PoleObservation::new(positions))
            } else {
                None
            };
            steps.push(LocalizationStep {
                motion: MotionSample::new(measured, covariance),
                observations,
            });
        }

        info!(
            "scenario: {} steps, {} poles, {} observation steps",
            steps.len(),
            map.len(),
            steps.iter().filter(|s| s.observations.is_some()).count()
        );
        Ok(Scenario { truth, map, steps })
    }

    pub fn start_pose(&self) -> &Pose {
        &self.truth[0]
    }

    /// Particle filter initialized around the true start pose with this scenario's map.
    pub fn particle_filter(&self, config: &ScenarioConfig) -> Result<ParticleFilter> {
        ParticleFilter::new(self.start_pose(), self.map.clone(), config.filter.clone())
    }

    /// Integrate the noisy odometry alone, without any pole information.
    pub fn dead_reckoning(&self) -> Vec<Pose> {
        let mut poses = Vec::with_capacity(self.steps.len() + 1);
        let mut pose = *self.start_pose();
        poses.push(pose);
        for step in &self.steps {
            pose = compose(&pose, &xyp_to_pose(&step.motion.mean));
            poses.push(pose);
        }
        poses
    }
}

fn validate(config: &ScenarioConfig) -> Result<()> {
    let problem = if !(config.step_length_m.is_finite() && config.step_length_m > 0.0) {
        format!("step length must be positive, got {}", config.step_length_m)
    } else if !(config.landmark_spacing_m.is_finite() && config.landmark_spacing_m > 0.0) {
        format!("landmark spacing must be positive, got {}", config.landmark_spacing_m)
    } else if !(config.odometry_noise_fraction.is_finite() && config.odometry_noise_fraction >= 0.0)
    {
        format!(
            "odometry noise fraction must be non-negative, got {}",
            config.odometry_noise_fraction
        )
    } else if !(config.observation_noise_std_m.is_finite() && config.observation_noise_std_m >= 0.0)
    {
        format!(
            "observation noise std must be non-negative, got {}",
            config.observation_noise_std_m
        )
    } else if !(config.observation_range_m.is_finite() && config.observation_range_m >= 0.0) {
        format!(
            "observation range must be non-negative, got {}",
            config.observation_range_m
        )
    } else if config.odometry_min_std.iter().any(|s| !(s.is_finite() && *s >= 0.0)) {
        format!(
            "odometry minimum std must be non-negative, got {:?}",
            config.odometry_min_std
        )
    } else {
        return Ok(());
    };
    Err(FilterError::InvalidConfig(problem))
}

/// Position and heading error of a run against ground truth.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ErrorStatistics {
    pub samples: usize,
    pub mean_position_m: f64,
    pub rms_position_m: f64,
    pub max_position_m: f64,
    pub mean_heading_rad: f64,
    pub rms_heading_rad: f64,
    pub max_heading_rad: f64,
}

impl ErrorStatistics {
    /// Compare estimates with truth pose by pose, over the shorter of the two sequences.
    ///
    /// Position error is the planar distance, heading error the absolute wrapped difference.
    pub fn compute(estimates: &[Pose], truth: &[Pose]) -> Self {
        let errors: Vec<(f64, f64)> = estimates
            .iter()
            .zip(truth)
            .map(|(estimate, actual)| {
                let e = pose_to_xyp(estimate);
                let t = pose_to_xyp(actual);
                (
                    (e[0] - t[0]).hypot(e[1] - t[1]),
                    wrap_angle(e[2] - t[2]).abs(),
                )
            })
            .collect();
        if errors.is_empty() {
            return ErrorStatistics::default();
        }
        let n = errors.len() as f64;
        let (position, heading): (Vec<f64>, Vec<f64>) = errors.into_iter().unzip();
        let mean = |v: &[f64]| v.iter().sum::<f64>() / n;
        let rms = |v: &[f64]| (v.iter().map(|x| x * x).sum::<f64>() / n).sqrt();
        let max = |v: &[f64]| v.iter().copied().fold(0.0, f64::max);
        ErrorStatistics {
            samples: position.len(),
            mean_position_m: mean(&position),
            rms_position_m: rms(&position),
            max_position_m: max(&position),
            mean_heading_rad: mean(&heading),
            rms_heading_rad: rms(&heading),
            max_heading_rad: max(&heading),
        }
    }
}

impl Display for ErrorStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} poses: position mean {:.3} m, rms {:.3} m, max {:.3} m; heading mean {:.3}°, rms {:.3}°, max {:.3}°",
            self.samples,
            self.mean_position_m,
            self.rms_position_m,
            self.max_position_m,
            self.mean_heading_rad.to_degrees(),
            self.rms_heading_rad.to_degrees(),
            self.max_heading_rad.to_degrees()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    /// Moves by the commanded mean and reports where it is; counts updates.
    struct DeadReckoner {
        pose: Pose,
        updates: usize,
    }

    impl LocalizationFilter for DeadReckoner {
        fn predict(&mut self, motion: &MotionSample) {
            self.pose = compose(&self.pose, &xyp_to_pose(&motion.mean));
        }
        fn update(&mut self, _observation: &PoleObservation) -> bool {
            self.updates += 1;
            // Snap back to the origin so the overwritten estimate is observable.
            self.pose = Pose::identity();
            true
        }
        fn estimate(&self) -> Pose {
            self.pose
        }
    }

    fn small_config() -> ScenarioConfig {
        ScenarioConfig {
            num_steps: 40,
            ..ScenarioConfig::default()
        }
    }

    #[test]
    fn driver_records_initial_and_per_step_estimates() {
        let step = |observed: bool| LocalizationStep {
            motion: MotionSample::deterministic(Vector3::new(1.0, 0.0, 0.0)),
            observations: observed.then(PoleObservation::default),
        };
        let steps = vec![step(false), step(false), step(true), step(false)];
        let mut filter = DeadReckoner {
            pose: Pose::identity(),
            updates: 0,
        };
        let result = run_localization(&mut filter, &steps);
        assert_eq!(result.estimates.len(), 5);
        assert_eq!(filter.updates, 1);
        assert_eq!(result.resample_count, 1);
        let xs: Vec<f64> = result.estimates.iter().map(|p| p.translation.x).collect();
        assert_eq!(xs, vec![0.0, 1.0, 2.0, 0.0, 1.0]);
    }

    #[test]
    fn scenario_is_reproducible() {
        let a = Scenario::generate(&small_config()).unwrap();
        let b = Scenario::generate(&small_config()).unwrap();
        assert_eq!(a.truth, b.truth);
        assert_eq!(a.steps, b.steps);
        assert_eq!(a.map.len(), b.map.len());
    }

    #[test]
    fn scenario_layout() {
        let config = small_config();
        let scenario = Scenario::generate(&config).unwrap();
        assert_eq!(scenario.truth.len(), 41);
        assert_eq!(scenario.steps.len(), 40);
        // Pairs at 0, 8, ..., 40 m of travel.
        assert_eq!(scenario.map.len(), 12);
        let observed: Vec<usize> = scenario
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.observations.is_some())
            .map(|(k, _)| k + 1)
            .collect();
        assert_eq!(observed, vec![5, 10, 15, 20, 25, 30, 35, 40]);
    }

    #[test]
    fn observations_respect_range() {
        let config = ScenarioConfig {
            observation_range_m: 7.0,
            ..small_config()
        };
        let scenario = Scenario::generate(&config).unwrap();
        let observed: usize = scenario
            .steps
            .iter()
            .filter_map(|s| s.observations.as_ref())
            .map(|o| o.len())
            .sum();
        let wide = Scenario::generate(&small_config()).unwrap();
        let observed_wide: usize = wide
            .steps
            .iter()
            .filter_map(|s| s.observations.as_ref())
            .map(|o| o.len())
            .sum();
        assert!(observed < observed_wide);
        for (k, step) in scenario.steps.iter().enumerate() {
            if let Some(observation) = &step.observations {
                let at = &scenario.truth[k + 1];
                for p in &observation.positions {
                    // Noise can push a detection just past the cutoff.
                    assert!(p.norm() <= 7.0 + 1.0, "step {k}: {p:?} from {at:?}");
                }
            }
        }
    }

    #[test]
    fn observations_match_truth_without_noise() {
        let config = ScenarioConfig {
            observation_noise_std_m: 0.0,
            ..small_config()
        };
        let scenario = Scenario::generate(&config).unwrap();
        let step = &scenario.steps[9];
        let observation = step.observations.as_ref().unwrap();
        assert!(!observation.is_empty());
        let at = &scenario.truth[10];
        for p in &observation.positions {
            assert!(p.norm() <= config.observation_range_m + 1e-9);
            let world = transform_point(at, p);
            let closest = scenario
                .map
                .positions()
                .map(|m| (m - world).norm())
                .fold(f64::INFINITY, f64::min);
            assert_approx_eq!(closest, 0.0, 1e-9);
        }
    }

    #[test]
    fn odometry_is_unbiased_and_reports_its_covariance() {
        let config = ScenarioConfig {
            num_steps: 2000,
            turn_rate_rad: 0.0,
            ..ScenarioConfig::default()
        };
        let scenario = Scenario::generate(&config).unwrap();
        let dx: Vec<f64> = scenario.steps.iter().map(|s| s.motion.mean[0]).collect();
        let mean = dx.iter().sum::<f64>() / dx.len() as f64;
        assert!((mean - 1.0).abs() < 0.005);
        let expected_std = 0.02 + 0.01;
        assert_approx_eq!(
            scenario.steps[0].motion.covariance[(0, 0)],
            expected_std * expected_std,
            1e-15
        );
        assert_eq!(scenario.steps[0].motion.covariance[(0, 1)], 0.0);
    }

    #[test]
    fn rejects_degenerate_scenarios() {
        for config in [
            ScenarioConfig { step_length_m: 0.0, ..small_config() },
            ScenarioConfig { landmark_spacing_m: 0.0, ..small_config() },
            ScenarioConfig { observation_noise_std_m: -1.0, ..small_config() },
            ScenarioConfig { observation_noise_std_m: f64::NAN, ..small_config() },
            ScenarioConfig { observation_range_m: -5.0, ..small_config() },
            ScenarioConfig { odometry_min_std: [0.0, -1.0, 0.0], ..small_config() },
        ] {
            assert!(matches!(
                Scenario::generate(&config),
                Err(FilterError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn error_statistics() {
        let truth = vec![Pose::identity(); 3];
        let estimates = vec![
            xyp_to_pose(&Vector3::new(3.0, 4.0, 0.0)),
            xyp_to_pose(&Vector3::new(0.0, 0.0, 0.2)),
            xyp_to_pose(&Vector3::new(0.0, 0.0, -0.1)),
        ];
        let stats = ErrorStatistics::compute(&estimates, &truth);
        assert_eq!(stats.samples, 3);
        assert_approx_eq!(stats.mean_position_m, 5.0 / 3.0, 1e-12);
        assert_approx_eq!(stats.rms_position_m, (25.0_f64 / 3.0).sqrt(), 1e-12);
        assert_approx_eq!(stats.max_position_m, 5.0, 1e-12);
        assert_approx_eq!(stats.mean_heading_rad, 0.1, 1e-12);
        assert_approx_eq!(stats.max_heading_rad, 0.2, 1e-12);
    }

    #[test]
    fn heading_error_wraps() {
        let truth = [xyp_to_pose(&Vector3::new(0.0, 0.0, PI - 0.01))];
        let estimate = [xyp_to_pose(&Vector3::new(0.0, 0.0, -PI + 0.01))];
        let stats = ErrorStatistics::compute(&estimate, &truth);
        assert_approx_eq!(stats.mean_heading_rad, 0.02, 1e-9);
        assert_eq!(ErrorStatistics::compute(&[], &truth), ErrorStatistics::default());
    }

    #[test]
    fn csv_round_trip() {
        let result = LocalizationResult {
            estimates: vec![
                Pose::identity(),
                xyp_to_pose(&Vector3::new(1.5, -2.0, 0.25)),
            ],
            resample_count: 4,
        };
        let path = std::env::temp_dir().join(format!("poleloc-sim-{}.csv", std::process::id()));
        result.to_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("step,x,y,phi"));
        let back = LocalizationResult::from_csv(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(back.estimates.len(), 2);
        let xyp = pose_to_xyp(&back.estimates[1]);
        assert_approx_eq!(xyp[0], 1.5, 1e-12);
        assert_approx_eq!(xyp[1], -2.0, 1e-12);
        assert_approx_eq!(xyp[2], 0.25, 1e-12);
    }
}
