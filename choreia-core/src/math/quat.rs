// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use glam::{Quat, Vec4};

/// Re-keys a quaternion onto its positive-W representative. `q` and `-q` encode the same
/// rotation, so dropping the W component is only reversible once every stored quaternion agrees
/// on the sign of W.
#[inline]
pub fn quat_ensure_positive_w(rotation: Quat) -> Quat {
    if rotation.w < 0.0 {
        -rotation
    }
    else {
        rotation
    }
}

/// Reconstructs a quaternion from its XYZ components, assuming W was dropped while non-negative.
///
/// Quantization can leave `x² + y² + z²` slightly above 1, so the radicand is clamped at 0. The
/// result is not renormalized here; interpolation normalizes.
#[inline]
pub fn quat_from_positive_w(components: Vec4) -> Quat {
    let w_squared = 1.0 - components.x * components.x
        - components.y * components.y
        - components.z * components.z;
    let w = w_squared.max(0.0).sqrt();
    Quat::from_xyzw(components.x, components.y, components.z, w)
}

/// Reinterprets a 4-component vector as a quaternion.
#[inline]
pub fn vec4_to_quat(components: Vec4) -> Quat {
    Quat::from_xyzw(components.x, components.y, components.z, components.w)
}

/// Normalized linear interpolation between two quaternions, taking the shortest path.
///
/// Samples on the uniform grid are dense enough that nlerp is indistinguishable from slerp while
/// being considerably cheaper.
#[inline]
pub fn quat_nlerp(start: Quat, end: Quat, alpha: f32) -> Quat {
    let start = Vec4::new(start.x, start.y, start.z, start.w);
    let mut end = Vec4::new(end.x, end.y, end.z, end.w);

    if start.dot(end) < 0.0 {
        end = -end;
    }

    let blended = start.lerp(end, alpha);
    vec4_to_quat(blended).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn verify_ensure_positive_w() {
        let rotation = Quat::from_axis_angle(Vec3::Y, 0.5);
        assert_eq!(quat_ensure_positive_w(rotation), rotation);

        let flipped = -rotation;
        let restored = quat_ensure_positive_w(flipped);
        assert!(restored.w >= 0.0);
        // Same rotation, same representative.
        assert!((restored.dot(rotation) - 1.0).abs() < 1.0e-6);
    }

    #[test]
    fn verify_from_positive_w_round_trip() {
        let rotation = quat_ensure_positive_w(Quat::from_axis_angle(Vec3::new(1.0, 2.0, -0.5).normalize(), 2.1));
        let reconstructed =
            quat_from_positive_w(Vec4::new(rotation.x, rotation.y, rotation.z, 0.0));
        assert!((reconstructed.dot(rotation)).abs() > 0.999_999);
    }

    #[test]
    fn verify_from_positive_w_clamps_radicand() {
        // A slightly over-unit XYZ must not produce a NaN W.
        let reconstructed = quat_from_positive_w(Vec4::new(0.8, 0.6, 0.1, 0.0));
        assert!(reconstructed.w == 0.0);
        assert!(reconstructed.is_finite());
    }

    #[test]
    fn verify_nlerp_endpoints_and_shortest_path() {
        let start = Quat::from_axis_angle(Vec3::Y, 0.2);
        let end = Quat::from_axis_angle(Vec3::Y, 0.9);

        assert!(quat_nlerp(start, end, 0.0).dot(start).abs() > 0.999_999);
        assert!(quat_nlerp(start, end, 1.0).dot(end).abs() > 0.999_999);

        // Interpolating towards the negated end must take the short way around.
        let mid = quat_nlerp(start, -end, 0.5);
        let expected = Quat::from_axis_angle(Vec3::Y, 0.55);
        assert!(mid.dot(expected).abs() > 0.999);
    }
}
