//! Linear algebra helpers for sampling from motion covariances.
//!
//! Public API:
//!     pub fn covariance_sqrt(matrix: &Matrix3<f64>) -> Matrix3<f64>
//!     pub fn sample_gaussian(mean, sqrt, rng) -> Vector3<f64>
//!
//! Internal pipeline (each step isolated for testing):
//!     - symmetrize()
//!     - chol_sqrt()
//!     - evd_symmetric_sqrt_with_floor()
//!
//! Strategy:
//! 1) Symmetrize P ← 0.5 (P + Pᵀ)
//! 2) Cholesky
//! 3) Symmetric EVD with eigenvalues floored at zero → S = U * sqrt(Λ⁺) * Uᵀ
//!
//! Odometry covariances are routinely singular (a zero heading change gives a zero variance
//! entry, a stationary vehicle gives the zero matrix), so step 3 is a regular path rather than
//! an error path. Flooring at exactly zero keeps a zero covariance a zero square root, which
//! makes noiseless motion deterministic.

use nalgebra::Matrix3;
use nalgebra::Vector3;
use nalgebra::linalg::{Cholesky, SymmetricEigen};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Compute a square root `S` of a positive semi-definite covariance such that `matrix ≈ S * Sᵀ`.
///
/// Attempts Cholesky decomposition first (yielding a lower triangular L). If that fails, which
/// happens for every singular covariance, the symmetric eigen-decomposition is used with
/// negative eigenvalues (round-off) clamped to zero.
///
/// # Arguments
/// * `matrix` - covariance of a relative motion `[dx, dy, dphi]`, assumed symmetric PSD.
///
/// # Returns
/// A matrix square root; lower triangular from Cholesky, symmetric from the EVD fallback.
pub fn covariance_sqrt(matrix: &Matrix3<f64>) -> Matrix3<f64> {
    let p = symmetrize(matrix);
    if let Some(s) = chol_sqrt(&p) {
        return s;
    }
    evd_symmetric_sqrt_with_floor(&p, 0.0)
}

/// Draw one sample from `N(mean, S Sᵀ)` given the square root `S` from [`covariance_sqrt`].
pub fn sample_gaussian<R: Rng + ?Sized>(
    mean: &Vector3<f64>,
    sqrt: &Matrix3<f64>,
    rng: &mut R,
) -> Vector3<f64> {
    let z = Vector3::from_fn(|_, _| StandardNormal.sample(&mut *rng));
    mean + sqrt * z
}

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
#[inline]
pub fn symmetrize(m: &Matrix3<f64>) -> Matrix3<f64> {
    0.5 * (m + m.transpose())
}

/// Plain Cholesky square root, or None if P is not positive definite.
///
/// A zero pivot can slip through the factorization and poison the lower rows with NaN, so the
/// factor is only accepted when it is finite.
fn chol_sqrt(p: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    Cholesky::new(*p)
        .map(|ch| ch.l())
        .filter(|l| l.iter().all(|v| v.is_finite()))
}

/// Symmetric EVD square root with eigenvalue flooring:
/// S = U * sqrt(max(λ, floor)) * Uᵀ
fn evd_symmetric_sqrt_with_floor(p: &Matrix3<f64>, floor: f64) -> Matrix3<f64> {
    let se = SymmetricEigen::new(*p);
    let u = se.eigenvectors;
    let sqrt_vals = se.eigenvalues.map(|l| l.max(floor).sqrt());
    u * Matrix3::from_diagonal(&sqrt_vals) * u.transpose()
}

/* =============================== Tests ==================================== */

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn max_abs_diff(a: &Matrix3<f64>, b: &Matrix3<f64>) -> f64 {
        (a - b).abs().max()
    }

    #[test]
    fn t_symmetrize() {
        let m = Matrix3::new(1.0, 2.0, 0.0, 0.0, 3.0, 4.0, 0.0, 0.0, 5.0);
        let s = symmetrize(&m);
        assert_eq!(s, s.transpose());
        assert_eq!(s[(0, 1)], 1.0);
    }

    #[test]
    fn t_chol_sqrt_spd() {
        let a = Matrix3::new(1.0, 2.0, 0.5, 0.0, 1.0, -1.0, 0.0, 0.0, 0.2);
        let p = a * a.transpose();
        let s = chol_sqrt(&p).expect("Cholesky should succeed for SPD");
        assert!(max_abs_diff(&(s * s.transpose()), &p) < 1e-12);
    }

    #[test]
    fn t_singular_diagonal_covariance() {
        // Straight-line odometry: no heading variance.
        let p = Matrix3::from_diagonal(&Vector3::new(0.04, 0.01, 0.0));
        let s = covariance_sqrt(&p);
        assert!(max_abs_diff(&(s * s.transpose()), &p) < 1e-12);
    }

    #[test]
    fn t_zero_covariance_gives_zero_root() {
        let s = covariance_sqrt(&Matrix3::zeros());
        assert_eq!(s, Matrix3::zeros());
    }

    #[test]
    fn t_evd_floor() {
        // Symmetric with a negative eigenvalue: the fallback must stay PSD.
        let p = Matrix3::new(0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let s = evd_symmetric_sqrt_with_floor(&p, 0.0);
        let back = s * s.transpose();
        let eig = SymmetricEigen::new(back).eigenvalues;
        assert!(eig.iter().all(|&l| l > -1e-12));
    }

    #[test]
    fn t_sampling_matches_covariance() {
        let p = Matrix3::from_diagonal(&Vector3::new(4.0, 1.0, 0.25));
        let s = covariance_sqrt(&p);
        let mean = Vector3::new(1.0, -1.0, 0.5);
        let mut rng = StdRng::seed_from_u64(7);
        let n = 20_000;
        let samples: Vec<Vector3<f64>> =
            (0..n).map(|_| sample_gaussian(&mean, &s, &mut rng)).collect();
        let sample_mean = samples.iter().sum::<Vector3<f64>>() / n as f64;
        let var_x = samples
            .iter()
            .map(|v| (v[0] - sample_mean[0]).powi(2))
            .sum::<f64>()
            / n as f64;
        assert!((sample_mean - mean).norm() < 0.05);
        assert!((var_x - 4.0).abs() < 0.2);
    }
}
