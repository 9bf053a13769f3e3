// SPDX-License-Identifier: CEPL-1.0
use glam::Vec3;

use crate::quantize::{dequantize_snorm8, quantize_snorm8, quantize_snorm8_ceil};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
}

impl Sphere {
    /// Centered on the axis-aligned box of `points`, radius reaching the
    /// furthest point. Empty input gives the zero sphere.
    pub fn enclosing(points: impl IntoIterator<Item = Vec3> + Clone) -> Sphere {
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        let mut any = false;
        for p in points.clone() {
            min = min.min(p);
            max = max.max(p);
            any = true;
        }
        if !any {
            return Sphere::default();
        }

        let center = (min + max) * 0.5;
        let radius = points
            .into_iter()
            .map(|p| p.distance(center))
            .fold(0.0f32, f32::max);
        Sphere { center, radius }
    }
}

/// Normal cone: every normal `n` it was built from satisfies
/// `dot(n, axis) >= sqrt(1 - cutoff^2)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Cone {
    pub axis: Vec3,
    /// Sine of the cone half-angle; 1.0 means the cone cannot reject anything.
    pub cutoff: f32,
}

impl Cone {
    /// A cone that never culls.
    pub const OPEN: Cone = Cone { axis: Vec3::Z, cutoff: 1.0 };

    /// Builds the cone around the average of `normals`. Zero-length normals
    /// (degenerate triangles) are ignored.
    pub fn from_normals(normals: impl IntoIterator<Item = Vec3> + Clone) -> Cone {
        let sum: Vec3 = normals
            .clone()
            .into_iter()
            .filter(|n| *n != Vec3::ZERO)
            .sum();
        let axis = sum.normalize_or_zero();
        if axis == Vec3::ZERO {
            return Cone::OPEN;
        }

        let min_dot = normals
            .into_iter()
            .filter(|n| *n != Vec3::ZERO)
            .map(|n| n.dot(axis))
            .fold(1.0f32, f32::min);

        let cutoff = if min_dot <= 0.0 {
            1.0
        } else {
            (1.0 - min_dot * min_dot).max(0.0).sqrt()
        };
        Cone { axis, cutoff }
    }

    /// Axis rounded to nearest. The cutoff absorbs the axis rounding error
    /// plus one step, so the stored cone never rejects a cluster the exact
    /// cone keeps.
    pub fn quantize(&self) -> ([i8; 3], i8) {
        let axis = [
            quantize_snorm8(self.axis.x),
            quantize_snorm8(self.axis.y),
            quantize_snorm8(self.axis.z),
        ];
        let error: f32 = axis
            .iter()
            .zip(self.axis.to_array())
            .map(|(&q, a)| (dequantize_snorm8(q) - a).abs())
            .sum();
        let cutoff = quantize_snorm8_ceil(self.cutoff + error).saturating_add(1).min(127);
        (axis, cutoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sphere_covers_every_point() {
        let pts = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(0.0, 4.0, 1.0),
        ];
        let s = Sphere::enclosing(pts);
        assert_eq!(s.center, Vec3::new(1.0, 2.0, 0.5));
        assert!(pts.iter().all(|&p| p.distance(s.center) <= s.radius + 1e-5));
        assert_eq!(Sphere::enclosing(std::iter::empty::<Vec3>()), Sphere::default());
    }

    #[test]
    fn flat_patch_has_tight_cone() {
        let c = Cone::from_normals([Vec3::Y, Vec3::Y, Vec3::Y]);
        assert!((c.axis - Vec3::Y).length() < 1e-6);
        assert!(c.cutoff.abs() < 1e-3);
    }

    #[test]
    fn hemisphere_spanning_normals_open_the_cone() {
        let c = Cone::from_normals([Vec3::X, Vec3::Y, -Vec3::X]);
        assert!((c.axis - Vec3::Y).length() < 1e-6);
        assert_eq!(c.cutoff, 1.0);
    }

    #[test]
    fn opposing_normals_fall_back_to_open_cone() {
        assert_eq!(Cone::from_normals([Vec3::X, -Vec3::X]), Cone::OPEN);
        assert_eq!(Cone::from_normals([Vec3::ZERO]), Cone::OPEN);
    }

    #[test]
    fn cutoff_matches_half_angle() {
        let a = Vec3::new(1.0, 1.0, 0.0).normalize();
        let b = Vec3::new(-1.0, 1.0, 0.0).normalize();
        let c = Cone::from_normals([a, b]);
        // 45 degree half-angle: min dot = cos 45, cutoff = sin 45
        assert!((c.cutoff - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-5);
        let (axis, cutoff) = c.quantize();
        assert_eq!(axis, [0, 127, 0]);
        // ceil(0.7071 * 127) = 90, plus one step of slack
        assert_eq!(cutoff, 91);
    }

    /// Task-stage rejection test, evaluated on the CPU.
    fn culled(center: Vec3, radius: f32, axis: Vec3, cutoff: f32, camera: Vec3) -> bool {
        let d = center - camera;
        d.dot(axis) >= cutoff * d.length() + radius
    }

    fn dequantized((axis, cutoff): ([i8; 3], i8)) -> (Vec3, f32) {
        (Vec3::from_array(axis.map(dequantize_snorm8)), dequantize_snorm8(cutoff))
    }

    #[test]
    fn off_axis_flat_cone_keeps_grazing_view() {
        let n = Vec3::new(0.6, 0.8, 0.0);
        let tangent = Vec3::new(-0.8, 0.6, 0.0);
        let exact = Cone::from_normals([n, n]);
        let (axis, cutoff) = dequantized(exact.quantize());

        // far along the surface, barely in front of it
        for side in [tangent, -tangent] {
            let camera = side * 1000.0 + n * 0.1;
            assert!(!culled(Vec3::ZERO, 0.5, exact.axis, exact.cutoff, camera));
            assert!(!culled(Vec3::ZERO, 0.5, axis, cutoff, camera), "{camera:?}");
        }
    }

    #[test]
    fn quantized_cone_never_culls_more_than_exact() {
        let dirs: Vec<Vec3> = (0..12)
            .flat_map(|i| (0..6).map(move |j| (i as f32 * 0.52, j as f32 * 0.5 - 1.3)))
            .map(|(yaw, pitch)| Vec3::new(yaw.cos() * pitch.cos(), pitch.sin(), yaw.sin() * pitch.cos()))
            .collect();

        for &a in &dirs {
            for spread in [0.0f32, 0.05, 0.3, 0.8] {
                let b = (a + Vec3::new(spread, -spread, spread * 0.5)).normalize();
                let exact = Cone::from_normals([a, b]);
                let (axis, cutoff) = dequantized(exact.quantize());
                for &dir in &dirs {
                    for dist in [0.5f32, 10.0, 1000.0] {
                        let camera = dir * dist;
                        if culled(Vec3::ZERO, 0.0, axis, cutoff, camera) {
                            assert!(
                                culled(Vec3::ZERO, 0.0, exact.axis, exact.cutoff, camera),
                                "{exact:?} camera {camera:?}"
                            );
                        }
                    }
                }
            }
        }
    }
}
