//! Planar pose algebra.
//!
//! Poses are 2D rigid transforms (x, y, heading) carried as [`nalgebra::Isometry2`], which is
//! the compact form of a 3×3 homogeneous transform. Composition is `a * b` and inversion is
//! `a.inverse()`; the helpers below add the conversions the filter needs: to and from compact
//! `[x, y, phi]` vectors (singly and in batches), to and from 4×4 homogeneous transforms (so
//! that full 3D vehicle poses can be projected onto the ground plane), and the weighted circular
//! mean used when collapsing particle headings into a single estimate.
//!
//! Naming follows the `T_a_b` convention used throughout the crate: `T_w_o` maps points from
//! frame `o` into frame `w`, so `T_w_o * T_o_v == T_w_v`.
use nalgebra::{Isometry2, Matrix4, Point2, Vector2, Vector3};
use std::f64::consts::PI;

/// A planar rigid transform (position + heading).
pub type Pose = Isometry2<f64>;

/// Build a pose from a compact `[x, y, phi]` vector.
pub fn xyp_to_pose(xyp: &Vector3<f64>) -> Pose {
    Isometry2::new(Vector2::new(xyp[0], xyp[1]), xyp[2])
}

/// Compact `[x, y, phi]` form of a pose. The heading is in (-pi, pi].
pub fn pose_to_xyp(pose: &Pose) -> Vector3<f64> {
    let t = pose.translation.vector;
    Vector3::new(t.x, t.y, pose.rotation.angle())
}

/// Batch form of [`xyp_to_pose`].
pub fn xyp_to_poses(xyps: &[Vector3<f64>]) -> Vec<Pose> {
    xyps.iter().map(xyp_to_pose).collect()
}

/// Batch form of [`pose_to_xyp`].
pub fn poses_to_xyp(poses: &[Pose]) -> Vec<Vector3<f64>> {
    poses.iter().map(pose_to_xyp).collect()
}

/// `a ∘ b`: apply `b` in the frame of `a`.
#[inline]
pub fn compose(a: &Pose, b: &Pose) -> Pose {
    a * b
}

#[inline]
pub fn invert(pose: &Pose) -> Pose {
    pose.inverse()
}

/// Map a point given in the pose's local frame into the parent frame.
#[inline]
pub fn transform_point(pose: &Pose, point: &Vector2<f64>) -> Vector2<f64> {
    (pose * Point2::from(*point)).coords
}

/// Project a 4×4 homogeneous transform onto the ground plane.
///
/// The translation keeps its x and y components and the heading is taken from the
/// first column of the rotation block, i.e. `atan2(R[1][0], R[0][0])`. Height, roll and pitch
/// are discarded.
pub fn from_homogeneous(matrix: &Matrix4<f64>) -> Pose {
    let phi = matrix[(1, 0)].atan2(matrix[(0, 0)]);
    Isometry2::new(Vector2::new(matrix[(0, 3)], matrix[(1, 3)]), phi)
}

/// Embed a planar pose into a 4×4 homogeneous transform (rotation about z, zero height).
pub fn to_homogeneous(pose: &Pose) -> Matrix4<f64> {
    let (sin, cos) = pose.rotation.angle().sin_cos();
    let t = pose.translation.vector;
    let mut matrix = Matrix4::identity();
    matrix[(0, 0)] = cos;
    matrix[(0, 1)] = -sin;
    matrix[(1, 0)] = sin;
    matrix[(1, 1)] = cos;
    matrix[(0, 3)] = t.x;
    matrix[(1, 3)] = t.y;
    matrix
}

/// Wrap an angle into (-pi, pi].
pub fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped <= -PI { wrapped + 2.0 * PI } else { wrapped }
}

/// Weighted circular mean of a set of angles.
///
/// Each angle contributes the unit vector `(cos, sin)` scaled by its weight and the mean is the
/// direction of the resulting sum. Weights must be non-negative but need not be normalized.
/// This is the generalization of the arithmetic mean that does not suffer from the
/// discontinuity at ±pi: the mean of `{0, 0, 2pi}` is `0`, not `2pi/3`.
///
/// # Arguments
/// * `angles` - angles in radians
/// * `weights` - one non-negative weight per angle
///
/// # Returns
/// The mean heading in (-pi, pi]. If the weighted vectors cancel exactly the result is `0.0`.
pub fn average_angles(angles: &[f64], weights: &[f64]) -> f64 {
    assert_eq!(
        angles.len(),
        weights.len(),
        "average_angles: one weight per angle is required"
    );
    let (sin_sum, cos_sum) = angles
        .iter()
        .zip(weights.iter())
        .fold((0.0, 0.0), |(s, c), (&angle, &weight)| {
            let (sin, cos) = angle.sin_cos();
            (s + weight * sin, c + weight * cos)
        });
    sin_sum.atan2(cos_sum)
}
