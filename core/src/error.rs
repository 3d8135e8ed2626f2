//! Error types for filter construction

use thiserror::Error;

/// Reasons a [`crate::particle::ParticleFilter`] cannot be built.
///
/// Updates never fail; every check happens once, at construction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("particle count must be positive")]
    NoParticles,

    #[error("landmark map is empty")]
    EmptyMap,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, FilterError>;
