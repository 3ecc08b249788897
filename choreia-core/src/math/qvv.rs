// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use glam::{Quat, Vec3};

/// A rotation/translation/scale transform, the unit of a skeletal pose.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Qvv {
    pub rotation: Quat,
    pub translation: Vec3,
    pub scale: Vec3,
}

impl Qvv {
    pub const IDENTITY: Qvv =
        Qvv { rotation: Quat::IDENTITY, translation: Vec3::ZERO, scale: Vec3::ONE };

    pub fn new(rotation: Quat, translation: Vec3, scale: Vec3) -> Self {
        Qvv { rotation, translation, scale }
    }

    /// Composes `self` (the parent transform) with a child's local transform, yielding the
    /// child's transform in the parent's space.
    #[inline]
    pub fn mul(&self, local: &Qvv) -> Qvv {
        Qvv {
            rotation: (self.rotation * local.rotation).normalize(),
            translation: self.transform_point(local.translation),
            scale: self.scale * local.scale,
        }
    }

    /// Transforms a point from local space into this transform's space.
    #[inline]
    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.rotation * (self.scale * point) + self.translation
    }

    /// Transforms a point ignoring scale.
    #[inline]
    pub fn transform_point_no_scale(&self, point: Vec3) -> Vec3 {
        self.rotation * point + self.translation
    }

    /// Composes ignoring scale on both sides.
    #[inline]
    pub fn mul_no_scale(&self, local: &Qvv) -> Qvv {
        Qvv {
            rotation: (self.rotation * local.rotation).normalize(),
            translation: self.transform_point_no_scale(local.translation),
            scale: Vec3::ONE,
        }
    }
}

impl Default for Qvv {
    fn default() -> Self {
        Qvv::IDENTITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_identity_composition() {
        let transform = Qvv::new(
            Quat::from_axis_angle(Vec3::Z, 0.7),
            Vec3::new(1.0, 2.0, 3.0),
            Vec3::splat(2.0),
        );

        let composed = Qvv::IDENTITY.mul(&transform);
        assert!((composed.rotation.dot(transform.rotation)).abs() > 0.999_999);
        assert!(composed.translation.abs_diff_eq(transform.translation, 1.0e-6));
        assert!(composed.scale.abs_diff_eq(transform.scale, 1.0e-6));
    }

    #[test]
    fn verify_point_transform() {
        let transform =
            Qvv::new(Quat::from_axis_angle(Vec3::Z, std::f32::consts::FRAC_PI_2), Vec3::X, Vec3::ONE);

        // Rotating +X by 90 degrees around Z yields +Y, then translate by +X.
        let point = transform.transform_point(Vec3::X);
        assert!(point.abs_diff_eq(Vec3::new(1.0, 1.0, 0.0), 1.0e-6));
    }

    #[test]
    fn verify_scale_composes_component_wise() {
        let parent = Qvv::new(Quat::IDENTITY, Vec3::ZERO, Vec3::new(2.0, 1.0, 1.0));
        let child = Qvv::new(Quat::IDENTITY, Vec3::new(1.0, 0.0, 0.0), Vec3::splat(3.0));

        let composed = parent.mul(&child);
        assert!(composed.translation.abs_diff_eq(Vec3::new(2.0, 0.0, 0.0), 1.0e-6));
        assert!(composed.scale.abs_diff_eq(Vec3::new(6.0, 3.0, 3.0), 1.0e-6));
    }
}
