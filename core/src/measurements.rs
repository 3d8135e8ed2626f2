//! Landmark measurement model.
//!
//! Pole detections are scored against the map with a zero-mean Gaussian on the distance between
//! a detection (mapped into the world frame through a particle's pose) and the closest mapped
//! pole. Two guards keep a single bad detection from deciding a particle's fate:
//!
//! * distances are clipped to `d_max`, the distance at which the density falls to a minimum
//!   value `p_min`, so a detection with no mapped pole nearby scores like one at `d_max`;
//! * a constant floor is added to every density term, bounding each factor away from zero.
//!
//! With variance σ² and minimum density p_min,
//!
//! $$
//! d_{max} = \sqrt{-2 \sigma^2 \ln\left(p_{min} \sqrt{2 \pi \sigma^2}\right)}
//! $$
//!
//! which only exists when the peak density `1 / sqrt(2πσ²)` exceeds p_min.

use std::f64::consts::PI;
use std::fmt::{self, Display};

use nalgebra::Vector2;

use crate::error::{FilterError, Result};
use crate::landmarks::LandmarkIndex;
use crate::pose::{Pose, transform_point};

/// Density of a zero-mean normal distribution with standard deviation `std_dev` at `x`.
pub fn gaussian_pdf(x: f64, std_dev: f64) -> f64 {
    let variance = std_dev * std_dev;
    (-0.5 * x * x / variance).exp() / (2.0 * PI * variance).sqrt()
}

/// Largest distance at which a zero-mean Gaussian with the given variance still reaches
/// `min_density`. Returns NaN or zero when the peak density itself is not above `min_density`.
pub fn max_detection_distance(variance: f64, min_density: f64) -> f64 {
    (-2.0 * variance * (min_density * (2.0 * PI * variance).sqrt()).ln()).sqrt()
}

/// One step's worth of pole detections in the vehicle frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PoleObservation {
    pub positions: Vec<Vector2<f64>>,
}

impl PoleObservation {
    pub fn new(positions: Vec<Vector2<f64>>) -> Self {
        PoleObservation { positions }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

impl Display for PoleObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoleObservation({} poles)", self.positions.len())
    }
}

/// Gaussian pole-detection likelihood with distance clipping and a density floor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoleLikelihood {
    std_dev: f64,
    max_distance: f64,
    floor: f64,
}

impl PoleLikelihood {
    /// Build the model for a landmark position variance.
    ///
    /// # Arguments
    /// * `variance` - variance σ² of a detected pole position (m²)
    /// * `min_density` - density p_min that defines the clipping distance `d_max`
    /// * `floor` - constant added to every per-detection density
    ///
    /// # Errors
    /// `InvalidConfig` when the variance is not positive and finite, when the floor is negative,
    /// or when the variance is so large that the Gaussian never reaches `min_density`.
    pub fn new(variance: f64, min_density: f64, floor: f64) -> Result<Self> {
        if !(variance.is_finite() && variance > 0.0) {
            return Err(FilterError::InvalidConfig(format!(
                "landmark variance must be positive and finite, got {variance}"
            )));
        }
        if !(floor.is_finite() && floor >= 0.0) {
            return Err(FilterError::InvalidConfig(format!(
                "likelihood floor must be non-negative, got {floor}"
            )));
        }
        let max_distance = max_detection_distance(variance, min_density);
        if !(max_distance.is_finite() && max_distance > 0.0) {
            return Err(FilterError::InvalidConfig(format!(
                "landmark variance {variance} never reaches minimum density {min_density}"
            )));
        }
        Ok(PoleLikelihood {
            std_dev: variance.sqrt(),
            max_distance,
            floor,
        })
    }

    /// Clipping distance `d_max`.
    pub fn max_distance(&self) -> f64 {
        self.max_distance
    }

    pub fn std_dev(&self) -> f64 {
        self.std_dev
    }

    pub fn floor(&self) -> f64 {
        self.floor
    }

    /// Weight factor for one detection given the distance to its closest mapped pole.
    ///
    /// `None` (nothing mapped within `d_max`) scores as a detection at `d_max`.
    pub fn detection_factor(&self, distance: Option<f64>) -> f64 {
        let d = distance
            .unwrap_or(self.max_distance)
            .clamp(0.0, self.max_distance);
        gaussian_pdf(d, self.std_dev) + self.floor
    }

    /// Sum of the log detection factors of all observed poles for one particle pose.
    ///
    /// Every factor is at least the density at `d_max`, so the sum stays finite however many
    /// poles are observed. An empty observation gives `0.0`.
    pub fn particle_log_likelihood(
        &self,
        pose: &Pose,
        observation: &PoleObservation,
        index: &LandmarkIndex,
    ) -> f64 {
        observation
            .positions
            .iter()
            .map(|p| {
                let world = transform_point(pose, p);
                self.detection_factor(index.nearest_distance(&world, self.max_distance))
                    .ln()
            })
            .sum()
    }

    /// Product of the detection factors of all observed poles for one particle pose.
    ///
    /// Underflows to zero for large observations; weight updates go through
    /// [`particle_log_likelihood`](Self::particle_log_likelihood).
    pub fn particle_likelihood(
        &self,
        pose: &Pose,
        observation: &PoleObservation,
        index: &LandmarkIndex,
    ) -> f64 {
        self.particle_log_likelihood(pose, observation, index).exp()
    }
}
