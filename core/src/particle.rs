//! Monte Carlo localization against a pole map.
//!
//! The belief over the vehicle pose is a fixed-size set of weighted pose hypotheses. Each time
//! step the filter is driven in a strict order:
//!
//! 1. [`ParticleFilter::update_motion`] propagates every particle by its own draw from the
//!    odometry distribution (`pose ← pose ∘ Δ`, Δ ~ N(mean, cov)).
//! 2. [`ParticleFilter::update_measurement`], when poles were detected, multiplies each weight by
//!    the likelihood of the detections given that particle's pose, renormalizes, and resamples
//!    when the normalized effective sample size falls below `min_neff`.
//! 3. [`ParticleFilter::estimate_pose`] collapses the set into one pose.
//!
//! Random draws come from a seeded [`StdRng`] owned by the filter and are taken sequentially, so
//! a run is reproducible; the per-particle transforms and likelihoods that consume them are
//! evaluated in parallel with rayon, each particle writing only its own slot.
use std::fmt::{self, Debug, Display};

use log::{debug, info, trace, warn};
use nalgebra::{Matrix3, Vector2, Vector3};
use rand::distr::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Distribution;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::FilterConfig;
use crate::error::{FilterError, Result};
use crate::landmarks::{LandmarkIndex, LandmarkMap};
use crate::linalg::{covariance_sqrt, sample_gaussian};
use crate::measurements::{PoleLikelihood, PoleObservation};
use crate::pose::{Pose, average_angles, compose, pose_to_xyp, xyp_to_pose};
use crate::{LocalizationFilter, MotionSample};

/// One pose hypothesis and its importance weight.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Particle {
    pub pose: Pose,
    pub weight: f64,
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let xyp = pose_to_xyp(&self.pose);
        f.debug_struct("Particle")
            .field("x", &xyp[0])
            .field("y", &xyp[1])
            .field("phi_deg", &xyp[2].to_degrees())
            .field("weight", &self.weight)
            .finish()
    }
}
impl Particle {
    pub fn new(pose: Pose, weight: f64) -> Particle {
        Particle { pose, weight }
    }
}

/// How the particle set is collapsed into a single pose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum ParticleAveragingStrategy {
    /// Weighted mean of all particles (circular mean for the heading).
    #[serde(rename = "mean")]
    #[value(name = "mean")]
    WeightedAverage,
    /// The single highest-weight particle.
    #[serde(rename = "max")]
    #[value(name = "max")]
    HighestWeight,
    /// Weighted mean of the highest-weight fraction of the particles.
    #[serde(rename = "best")]
    #[value(name = "best")]
    BestFraction,
}
impl Default for ParticleAveragingStrategy {
    fn default() -> Self {
        ParticleAveragingStrategy::BestFraction
    }
}
impl Display for ParticleAveragingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParticleAveragingStrategy::WeightedAverage => "mean",
            ParticleAveragingStrategy::HighestWeight => "max",
            ParticleAveragingStrategy::BestFraction => "best",
        };
        f.write_str(name)
    }
}

/// Systematic resampling.
///
/// Draws one offset `u ~ U[0, 1/N)` and selects, for each `i`, the first particle whose
/// cumulative weight reaches `u + i/N`. A single forward-only pointer walks the cumulative sum,
/// so the whole pass is O(N). The pointer never passes the last index, which absorbs a
/// cumulative sum that rounds to slightly less than one.
///
/// # Arguments
/// * `weights` - normalized particle weights
/// * `rng` - random number generator for the offset
///
/// # Returns
/// The selected particle indices, non-decreasing, one per particle.
pub fn systematic_resample<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Vec<usize> {
    let n = weights.len();
    if n == 0 {
        return Vec::new();
    }
    let step = 1.0 / n as f64;
    let cumulative: Vec<f64> = weights
        .iter()
        .scan(0.0, |sum, &w| {
            *sum += w;
            Some(*sum)
        })
        .collect();
    let offset = rng.random::<f64>() * step;

    let mut indices = Vec::with_capacity(n);
    let mut j = 0;
    for i in 0..n {
        let target = offset + i as f64 * step;
        while j < n - 1 && cumulative[j] < target {
            j += 1;
        }
        indices.push(j);
    }
    indices
}

/// Particle filter localizing a vehicle against a pole map.
#[derive(Clone)]
pub struct ParticleFilter {
    particles: Vec<Particle>,
    map: LandmarkMap,
    index: LandmarkIndex,
    likelihood: PoleLikelihood,
    config: FilterConfig,
    /// `T_w_o`: the frame estimates are averaged in.
    reference: Pose,
    /// `T_o_w`, cached.
    reference_inv: Pose,
    rng: StdRng,
}
impl Debug for ParticleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let estimate = pose_to_xyp(&self.estimate_pose());
        let min_weight = self
            .particles
            .iter()
            .map(|p| p.weight)
            .fold(f64::INFINITY, f64::min);
        let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
        f.debug_struct("ParticleFilter")
            .field("num_particles", &self.particles.len())
            .field("num_landmarks", &self.map.len())
            .field(
                "likelihood",
                &format_args!(
                    "σ {:.3} m, d_max {:.3} m, floor {}",
                    self.likelihood.std_dev(),
                    self.likelihood.max_distance(),
                    self.likelihood.floor()
                ),
            )
            .field("neff", &self.neff())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .field("strategy", &format_args!("{}", self.config.estimation_strategy))
            .field(
                "estimate",
                &format_args!(
                    "({:.3} m, {:.3} m, {:.2}°)",
                    estimate[0],
                    estimate[1],
                    estimate[2].to_degrees()
                ),
            )
            .finish()
    }
}
impl ParticleFilter {
    /// Scatter `config.num_particles` particles around `start` and index the landmark map.
    ///
    /// Each particle is offset from `start` by a distance drawn uniformly from
    /// `[0, position_range_m]` in a uniformly random direction, and by a heading drawn uniformly
    /// from `[-angle_range_rad, angle_range_rad]`. Weights start uniform.
    ///
    /// # Errors
    /// * [`FilterError::NoParticles`] for a particle count of zero
    /// * [`FilterError::EmptyMap`] for a map without landmarks
    /// * [`FilterError::InvalidConfig`] for out-of-range knobs or a landmark variance whose
    ///   Gaussian never reaches `min_density`
    pub fn new(start: &Pose, map: LandmarkMap, config: FilterConfig) -> Result<Self> {
        if config.num_particles == 0 {
            return Err(FilterError::NoParticles);
        }
        let seed = vec![Particle::new(*start, 1.0); config.num_particles];
        let mut filter = ParticleFilter::from_particles(seed, map, config)?;
        filter.scatter(start)?;
        Ok(filter)
    }

    /// Build a filter from an explicit particle set. Weights are normalized and the particle
    /// count of `config` is replaced by the size of the set.
    ///
    /// # Errors
    /// As [`ParticleFilter::new`], with [`FilterError::NoParticles`] for an empty set.
    pub fn from_particles(
        particles: Vec<Particle>,
        map: LandmarkMap,
        mut config: FilterConfig,
    ) -> Result<Self> {
        if particles.is_empty() {
            return Err(FilterError::NoParticles);
        }
        if map.is_empty() {
            return Err(FilterError::EmptyMap);
        }
        config.num_particles = particles.len();
        validate(&config)?;
        let likelihood = PoleLikelihood::new(
            config.landmark_variance,
            config.min_density,
            config.likelihood_floor,
        )?;

        let index = LandmarkIndex::new(&map);
        let reference = xyp_to_pose(&Vector3::from(config.reference_pose));
        info!(
            "particle filter: {} particles, {} landmarks, d_max {:.3} m, estimator '{}'",
            config.num_particles,
            map.len(),
            likelihood.max_distance(),
            config.estimation_strategy
        );
        let mut filter = ParticleFilter {
            particles,
            map,
            index,
            likelihood,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            reference,
            reference_inv: reference.inverse(),
        };
        filter.normalize_weights();
        Ok(filter)
    }

    /// Replace the particle set with uniformly weighted draws around `start`.
    fn scatter(&mut self, start: &Pose) -> Result<()> {
        let radius = uniform(0.0, self.config.position_range_m)?;
        let bearing = uniform(-std::f64::consts::PI, std::f64::consts::PI)?;
        let heading = uniform(-self.config.angle_range_rad, self.config.angle_range_rad)?;
        let weight = 1.0 / self.particles.len() as f64;
        let rng = &mut self.rng;
        for particle in self.particles.iter_mut() {
            let r = radius.sample(rng);
            let a = bearing.sample(rng);
            let offset = Vector3::new(r * a.cos(), r * a.sin(), heading.sample(rng));
            *particle = Particle::new(compose(start, &xyp_to_pose(&offset)), weight);
        }
        Ok(())
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn weights(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.weight).collect()
    }

    pub fn num_particles(&self) -> usize {
        self.particles.len()
    }

    pub fn map(&self) -> &LandmarkMap {
        &self.map
    }

    pub fn likelihood(&self) -> &PoleLikelihood {
        &self.likelihood
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn estimation_strategy(&self) -> ParticleAveragingStrategy {
        self.config.estimation_strategy
    }

    pub fn set_estimation_strategy(&mut self, strategy: ParticleAveragingStrategy) {
        self.config.estimation_strategy = strategy;
    }

    /// Set the resampling threshold on the normalized effective sample size.
    pub fn set_min_neff(&mut self, min_neff: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&min_neff) {
            return Err(FilterError::InvalidConfig(format!(
                "min_neff must lie in [0, 1], got {min_neff}"
            )));
        }
        self.config.min_neff = min_neff;
        Ok(())
    }

    /// N_eff = 1 / sum(w_i^2), between 1 and N.
    pub fn effective_sample_size(&self) -> f64 {
        let sum_of_squares: f64 = self.particles.iter().map(|p| p.weight * p.weight).sum();
        if sum_of_squares > 0.0 {
            1.0 / sum_of_squares
        } else {
            0.0
        }
    }

    /// Normalized effective sample size `1 / (N * sum(w_i^2))`, in (1/N, 1].
    pub fn neff(&self) -> f64 {
        self.effective_sample_size() / self.particles.len() as f64
    }

    /// Motion update: right-compose every particle with its own draw from N(mean, covariance).
    ///
    /// `mean` is the relative motion `[dx, dy, dphi]` in the vehicle frame of the previous step
    /// and `covariance` its 3×3 covariance, assumed positive semi-definite. A zero covariance
    /// moves every particle by exactly `mean`. Weights are not touched.
    pub fn update_motion(&mut self, mean: &Vector3<f64>, covariance: &Matrix3<f64>) {
        let sqrt = covariance_sqrt(covariance);
        let rng = &mut self.rng;
        let deltas: Vec<Pose> = (0..self.particles.len())
            .map(|_| xyp_to_pose(&sample_gaussian(mean, &sqrt, rng)))
            .collect();
        self.particles
            .par_iter_mut()
            .zip(deltas.par_iter())
            .for_each(|(particle, delta)| particle.pose = compose(&particle.pose, delta));
    }

    /// Measurement update with one step's pole detections (vehicle frame).
    ///
    /// Every weight is multiplied by the detection likelihood of its particle and the weights are
    /// renormalized. Likelihoods are combined in the log domain, relative to the most likely
    /// particle. With `allow_resample` set, the set is resampled when the normalized effective
    /// sample size drops below `min_neff`.
    ///
    /// Returns true if resampling was performed.
    pub fn update_measurement(&mut self, observation: &PoleObservation, allow_resample: bool) -> bool {
        let likelihood = &self.likelihood;
        let index = &self.index;
        let log_likelihoods: Vec<f64> = self
            .particles
            .par_iter()
            .map(|particle| likelihood.particle_log_likelihood(&particle.pose, observation, index))
            .collect();
        // Scale by the best particle before leaving the log domain so large observations do not
        // underflow every weight to zero.
        let max_log = log_likelihoods
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        if max_log.is_finite() {
            self.particles
                .par_iter_mut()
                .zip(log_likelihoods.par_iter())
                .for_each(|(particle, log_likelihood)| {
                    particle.weight *= (log_likelihood - max_log).exp();
                });
        }
        self.normalize_weights();

        let neff = self.neff();
        trace!("measurement update with {}: neff {:.4}", observation, neff);
        if allow_resample && neff < self.config.min_neff {
            debug!(
                "neff {:.4} below {:.4}, resampling {} particles",
                neff,
                self.config.min_neff,
                self.particles.len()
            );
            self.resample();
            true
        } else {
            false
        }
    }

    /// Rescale weights to sum to one. A set whose weights all vanished (or overflowed) is reset
    /// to uniform weights.
    pub fn normalize_weights(&mut self) {
        let sum: f64 = self.particles.iter().map(|p| p.weight).sum();
        if sum > 0.0 && sum.is_finite() {
            for particle in &mut self.particles {
                particle.weight /= sum;
            }
        } else {
            warn!("degenerate particle weights (sum {sum}), resetting to uniform");
            let uniform = 1.0 / self.particles.len() as f64;
            for particle in &mut self.particles {
                particle.weight = uniform;
            }
        }
    }

    /// Systematic resampling; weights are reset to `1/N`.
    pub fn resample(&mut self) {
        let weights = self.weights();
        let indices = systematic_resample(&weights, &mut self.rng);
        let uniform = 1.0 / self.particles.len() as f64;
        self.particles = indices
            .into_iter()
            .map(|i| Particle::new(self.particles[i].pose, uniform))
            .collect();
    }

    /// Collapse the particle set into one world-frame pose using the configured strategy.
    pub fn estimate_pose(&self) -> Pose {
        match self.config.estimation_strategy {
            ParticleAveragingStrategy::WeightedAverage => {
                let all: Vec<&Particle> = self.particles.iter().collect();
                self.average_in_reference_frame(&all)
            }
            ParticleAveragingStrategy::HighestWeight => self
                .particles
                .iter()
                .max_by(|a, b| a.weight.total_cmp(&b.weight))
                .map_or_else(Pose::identity, |p| p.pose),
            ParticleAveragingStrategy::BestFraction => {
                let n = self.particles.len();
                let count = ((self.config.best_fraction * n as f64).floor() as usize).clamp(1, n);
                let mut ranked: Vec<&Particle> = self.particles.iter().collect();
                ranked.select_nth_unstable_by(count - 1, |a, b| b.weight.total_cmp(&a.weight));
                ranked.truncate(count);
                self.average_in_reference_frame(&ranked)
            }
        }
    }

    /// Weighted mean of the given particles, taken in the reference frame `T_o_w` so that
    /// headings near the operating region do not straddle the ±pi cut.
    fn average_in_reference_frame(&self, selected: &[&Particle]) -> Pose {
        let total: f64 = selected.iter().map(|p| p.weight).sum();
        let weights: Vec<f64> = if total > 0.0 && total.is_finite() {
            selected.iter().map(|p| p.weight / total).collect()
        } else {
            vec![1.0 / selected.len() as f64; selected.len()]
        };
        let xyps: Vec<Vector3<f64>> = selected
            .iter()
            .map(|p| pose_to_xyp(&compose(&self.reference_inv, &p.pose)))
            .collect();
        let xy = xyps
            .iter()
            .zip(weights.iter())
            .fold(Vector2::zeros(), |acc, (v, &w)| acc + v.xy() * w);
        let headings: Vec<f64> = xyps.iter().map(|v| v[2]).collect();
        let phi = average_angles(&headings, &weights);
        compose(&self.reference, &xyp_to_pose(&Vector3::new(xy.x, xy.y, phi)))
    }
}

impl LocalizationFilter for ParticleFilter {
    fn predict(&mut self, motion: &MotionSample) {
        self.update_motion(&motion.mean, &motion.covariance);
    }
    fn update(&mut self, observation: &PoleObservation) -> bool {
        self.update_measurement(observation, true)
    }
    fn estimate(&self) -> Pose {
        self.estimate_pose()
    }
}

fn validate(config: &FilterConfig) -> Result<()> {
    let problem = if !(config.position_range_m.is_finite() && config.position_range_m >= 0.0) {
        format!("position range must be non-negative, got {}", config.position_range_m)
    } else if !(config.angle_range_rad.is_finite() && config.angle_range_rad >= 0.0) {
        format!("angle range must be non-negative, got {}", config.angle_range_rad)
    } else if !(0.0..=1.0).contains(&config.min_neff) {
        format!("min_neff must lie in [0, 1], got {}", config.min_neff)
    } else if !(config.best_fraction > 0.0 && config.best_fraction <= 1.0) {
        format!("best_fraction must lie in (0, 1], got {}", config.best_fraction)
    } else if config.reference_pose.iter().any(|v| !v.is_finite()) {
        "reference pose must be finite".to_string()
    } else {
        return Ok(());
    };
    Err(FilterError::InvalidConfig(problem))
}

fn uniform(low: f64, high: f64) -> Result<Uniform<f64>> {
    Uniform::new_inclusive(low, high).map_err(|e| FilterError::InvalidConfig(e.to_string()))
}
