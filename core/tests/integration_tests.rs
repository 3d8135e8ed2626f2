//! End-to-end localization tests
//!
//! These tests run the particle filter through complete localization loops, from construction
//! through repeated motion, measurement, resampling and estimation, on small hand-built maps and
//! on generated scenarios.
//!
//! ## Error Metrics
//!
//! - **Position error**: planar distance between estimated and true pose (meters)
//! - **Heading error**: absolute wrapped heading difference (radians)
//!
//! The error bounds asserted on generated scenarios are not theoretical or design goals. They
//! are loose regression checks meant to catch changes that break convergence, not to measure
//! accuracy.
use nalgebra::{Matrix3, Vector2, Vector3};

use poleloc::LocalizationFilter;
use poleloc::MotionSample;
use poleloc::config::{FilterConfig, ScenarioConfig};
use poleloc::landmarks::LandmarkMap;
use poleloc::measurements::PoleObservation;
use poleloc::particle::{Particle, ParticleAveragingStrategy, ParticleFilter};
use poleloc::pose::{Pose, pose_to_xyp, xyp_to_pose};
use poleloc::sim::{ErrorStatistics, Scenario, run_localization};

use assert_approx_eq::assert_approx_eq;

fn pole_map() -> LandmarkMap {
    LandmarkMap::from_positions(&[Vector2::new(10.0, 0.0)])
}

#[test]
fn correct_particle_takes_over_after_resampling() {
    let particles = vec![
        Particle::new(xyp_to_pose(&Vector3::new(0.0, 0.0, 0.0)), 1.0),
        Particle::new(xyp_to_pose(&Vector3::new(5.0, 0.0, 0.0)), 1.0),
    ];
    let config = FilterConfig {
        min_neff: 1.0,
        estimation_strategy: ParticleAveragingStrategy::HighestWeight,
        ..FilterConfig::default()
    };
    let mut filter = ParticleFilter::from_particles(particles, pole_map(), config).unwrap();
    let observation = PoleObservation::new(vec![Vector2::new(10.0, 0.0)]);

    for _ in 0..20 {
        filter.update_measurement(&observation, true);
        assert_approx_eq!(filter.weights().iter().sum::<f64>(), 1.0, 1e-12);
    }
    assert!(
        filter
            .particles()
            .iter()
            .all(|p| p.pose.translation.x == 0.0)
    );
    assert_eq!(filter.estimate_pose(), Pose::identity());
}

#[test]
fn misses_do_not_zero_the_weights() {
    let mut filter = ParticleFilter::new(
        &Pose::identity(),
        pole_map(),
        FilterConfig {
            num_particles: 100,
            ..FilterConfig::default()
        },
    )
    .unwrap();
    // Nothing mapped anywhere near these detections.
    let observation = PoleObservation::new(vec![Vector2::new(-50.0, 40.0); 30]);
    filter.update_measurement(&observation, false);
    assert!(filter.particles().iter().all(|p| p.weight > 0.0));
    assert_approx_eq!(filter.neff(), 1.0, 1e-9);
}

#[test]
fn filter_follows_a_straight_drive_along_pole_rows() {
    let map = LandmarkMap::from_positions(&[
        Vector2::new(10.0, 5.0),
        Vector2::new(10.0, -5.0),
        Vector2::new(20.0, 5.0),
        Vector2::new(20.0, -5.0),
        Vector2::new(30.0, 5.0),
        Vector2::new(30.0, -5.0),
    ]);
    let config = FilterConfig {
        num_particles: 1000,
        position_range_m: 2.0,
        ..FilterConfig::default()
    };
    let mut filter = ParticleFilter::new(&Pose::identity(), map.clone(), config).unwrap();
    let std = Vector3::new(0.02, 0.01, 0.001);
    let covariance = Matrix3::from_diagonal(&std.component_mul(&std));

    let mut truth = Pose::identity();
    for k in 1..=20 {
        let motion = MotionSample::new(Vector3::new(1.0, 0.0, 0.0), covariance);
        filter.predict(&motion);
        truth = truth * xyp_to_pose(&motion.mean);
        if k % 2 == 0 {
            let inverse = truth.inverse();
            let poles = map
                .positions()
                .map(|p| inverse * nalgebra::Point2::from(*p))
                .filter(|p| p.coords.norm() < 20.0)
                .map(|p| p.coords)
                .collect();
            filter.update(&PoleObservation::new(poles));
        }
    }
    let estimate = pose_to_xyp(&filter.estimate());
    assert!((estimate[0] - 20.0).abs() < 0.75, "x = {}", estimate[0]);
    assert!(estimate[1].abs() < 0.75, "y = {}", estimate[1]);
    assert!(estimate[2].abs() < 0.06, "phi = {}", estimate[2]);
}

#[test]
fn runs_are_reproducible() {
    let config = ScenarioConfig {
        num_steps: 60,
        filter: FilterConfig {
            num_particles: 300,
            ..FilterConfig::default()
        },
        ..ScenarioConfig::default()
    };
    let scenario = Scenario::generate(&config).unwrap();
    let mut a = scenario.particle_filter(&config).unwrap();
    let mut b = scenario.particle_filter(&config).unwrap();
    let first = run_localization(&mut a, &scenario.steps);
    let second = run_localization(&mut b, &scenario.steps);
    assert_eq!(first, second);
    assert_eq!(first.estimates.len(), 61);
}

#[test]
fn generated_scenario_stays_localized() {
    let config = ScenarioConfig {
        num_steps: 200,
        filter: FilterConfig {
            num_particles: 1000,
            ..FilterConfig::default()
        },
        ..ScenarioConfig::default()
    };
    let scenario = Scenario::generate(&config).unwrap();
    let mut filter = scenario.particle_filter(&config).unwrap();
    let result = run_localization(&mut filter, &scenario.steps);
    assert_eq!(result.estimates.len(), scenario.truth.len());
    assert!(result.resample_count > 0);

    let stats = ErrorStatistics::compute(&result.estimates, &scenario.truth);
    assert!(stats.mean_position_m < 1.0, "{stats}");
    assert!(stats.mean_heading_rad < 0.05, "{stats}");

    // The second half, after convergence, is tighter than the run as a whole.
    let half = scenario.truth.len() / 2;
    let settled = ErrorStatistics::compute(&result.estimates[half..], &scenario.truth[half..]);
    assert!(settled.max_position_m < 1.5, "{settled}");
}

#[test]
fn every_strategy_localizes() {
    let base = ScenarioConfig {
        num_steps: 100,
        filter: FilterConfig {
            num_particles: 500,
            ..FilterConfig::default()
        },
        ..ScenarioConfig::default()
    };
    let scenario = Scenario::generate(&base).unwrap();
    for strategy in [
        ParticleAveragingStrategy::WeightedAverage,
        ParticleAveragingStrategy::HighestWeight,
        ParticleAveragingStrategy::BestFraction,
    ] {
        let mut config = base.clone();
        config.filter.estimation_strategy = strategy;
        let mut filter = scenario.particle_filter(&config).unwrap();
        let result = run_localization(&mut filter, &scenario.steps);
        let last = result.estimates.len() - 1;
        let stats =
            ErrorStatistics::compute(&result.estimates[last..], &scenario.truth[last..]);
        assert!(stats.max_position_m < 1.0, "{strategy}: {stats}");
    }
}
