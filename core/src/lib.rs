//! Pole-based Monte Carlo localization
//!
//! This crate localizes a ground vehicle in the plane against a prior map of pole-like landmarks
//! (street lamps, sign posts, tree trunks). The belief over the vehicle pose is represented by a
//! particle filter: a fixed-size set of weighted pose hypotheses that is propagated with noisy
//! odometry, reweighted by how well the poles detected in the vehicle frame line up with the map,
//! resampled when the weights degenerate, and collapsed into a single pose estimate each step.
//!
//! The filter itself is sensor agnostic. It consumes relative motion with a covariance and, when
//! available, a set of 2D pole positions in the vehicle frame; extracting poles from range data
//! and building the map are left to the caller. A synthetic scenario generator is included for
//! running and testing the filter end to end.
//!
//! This crate is primarily built off of the following dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): poses as `Isometry2` and the linear algebra behind the noise models.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): seeded random number generation for sampling motion noise and resampling.
//! - [`rstar`](https://crates.io/crates/rstar): R-tree nearest-neighbor queries against the landmark map.
//! - [`rayon`](https://crates.io/crates/rayon): data-parallel per-particle updates.
//!
//! ## Crate overview
//!
//! - [config]: Filter and scenario configuration, readable from JSON, YAML and TOML.
//! - [error]: Construction errors.
//! - [landmarks]: The landmark map and its spatial index.
//! - [linalg]: Covariance square roots and Gaussian sampling.
//! - [measurements]: The pole detection likelihood.
//! - [particle]: The particle filter.
//! - [pose]: Planar pose conversions and angle helpers.
//! - [sim]: The localization driver, synthetic scenarios and error statistics.
//!
//! ## Pose convention
//!
//! A pose `[x, y, phi]` is the transform from the vehicle frame to the world frame: a point `p`
//! expressed in the vehicle frame is at `R(phi) p + [x, y]` in the world frame. Motion is right
//! composed, `T_k = T_{k-1} ∘ Δ`, with `Δ` expressed in the vehicle frame at `k-1`. Headings are
//! reported in `(-pi, pi]`.
//!
//! ## Usage
//!
//! ```rust
//! use nalgebra::{Matrix3, Vector2, Vector3};
//! use poleloc::config::FilterConfig;
//! use poleloc::landmarks::LandmarkMap;
//! use poleloc::measurements::PoleObservation;
//! use poleloc::particle::ParticleFilter;
//! use poleloc::pose::Pose;
//!
//! let map = LandmarkMap::from_positions(&[Vector2::new(10.0, 0.0), Vector2::new(0.0, 8.0)]);
//! let config = FilterConfig { num_particles: 500, ..FilterConfig::default() };
//! let mut filter = ParticleFilter::new(&Pose::identity(), map, config).unwrap();
//!
//! let covariance = Matrix3::from_diagonal(&Vector3::new(1e-4, 1e-4, 1e-6));
//! filter.update_motion(&Vector3::new(1.0, 0.0, 0.0), &covariance);
//! let poles = PoleObservation::new(vec![Vector2::new(9.0, 0.0), Vector2::new(-1.0, 8.0)]);
//! filter.update_measurement(&poles, true);
//! let estimate = filter.estimate_pose();
//! assert!((estimate.translation.x - 1.0).abs() < 2.0);
//! ```
pub mod config;
pub mod error;
pub mod landmarks;
pub mod linalg;
pub mod measurements;
pub mod particle;
pub mod pose;
pub mod sim;

use std::fmt::{self, Display};

use nalgebra::{Matrix3, Vector3};

use crate::measurements::PoleObservation;
use crate::pose::Pose;

/// Relative motion since the previous step, `[dx, dy, dphi]` in the previous vehicle frame, and
/// its covariance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotionSample {
    pub mean: Vector3<f64>,
    pub covariance: Matrix3<f64>,
}
impl Display for MotionSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MotionSample {{ mean: [{:.4}, {:.4}, {:.4}], std: [{:.4}, {:.4}, {:.4}] }}",
            self.mean[0],
            self.mean[1],
            self.mean[2],
            self.covariance[(0, 0)].sqrt(),
            self.covariance[(1, 1)].sqrt(),
            self.covariance[(2, 2)].sqrt()
        )
    }
}
impl MotionSample {
    pub fn new(mean: Vector3<f64>, covariance: Matrix3<f64>) -> Self {
        MotionSample { mean, covariance }
    }
    /// Noise-free motion.
    pub fn deterministic(mean: Vector3<f64>) -> Self {
        MotionSample {
            mean,
            covariance: Matrix3::zeros(),
        }
    }
    /// Motion with independent per-component noise proportional to the motion itself,
    /// `cov = diag((fraction * mean)^2)`.
    pub fn proportional(mean: Vector3<f64>, fraction: f64) -> Self {
        let std = mean * fraction;
        MotionSample {
            mean,
            covariance: Matrix3::from_diagonal(&std.component_mul(&std)),
        }
    }
    /// Relative motion between two consecutive poses, `xyp(inv(previous) ∘ current)`.
    pub fn between(previous: &Pose, current: &Pose, fraction: f64) -> Self {
        let delta = pose::pose_to_xyp(&pose::compose(&pose::invert(previous), current));
        MotionSample::proportional(delta, fraction)
    }
}

/// Common interface of a sequential pose estimator.
///
/// Each time step is driven in a fixed order: `predict` with the motion since the last step,
/// then `update` if landmarks were observed, then `estimate`.
pub trait LocalizationFilter {
    /// Propagate the belief by one step of relative motion.
    fn predict(&mut self, motion: &MotionSample);
    /// Incorporate one step's landmark observations. Returns true if the belief was resampled.
    fn update(&mut self, observation: &PoleObservation) -> bool;
    /// Current point estimate of the pose.
    fn estimate(&self) -> Pose;
}
