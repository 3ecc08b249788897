// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `error_metric` module defines how pose error is measured during compression.
//!
//! The bit-rate search never looks at raw component deltas: a small quaternion error on a hip
//! bone moves a foot much further than the same error on a finger tip. Metrics therefore
//! measure the displacement of virtual vertices rigidly attached to each bone, either in the
//! bone's local space or accumulated through the hierarchy into object space.

use choreia_core::checksum::hash32;
use choreia_core::math::Qvv;

use crate::tracks::Skeleton;

use glam::Vec3;

/// Measures the error introduced on one bone by a lossy pose, relative to the raw pose.
///
/// `base_pose` carries the additive base when compressing additive clips and is empty
/// otherwise.
pub trait TransformErrorMetric {
    /// A stable fingerprint of the metric so it can participate in settings hashing.
    fn get_hash(&self) -> u32;

    fn calculate_local_bone_error(
        &self,
        skeleton: &Skeleton,
        raw_pose: &[Qvv],
        base_pose: &[Qvv],
        lossy_pose: &[Qvv],
        bone_index: u32,
    ) -> f32;

    fn calculate_local_bone_error_no_scale(
        &self,
        skeleton: &Skeleton,
        raw_pose: &[Qvv],
        base_pose: &[Qvv],
        lossy_pose: &[Qvv],
        bone_index: u32,
    ) -> f32;

    fn calculate_object_bone_error(
        &self,
        skeleton: &Skeleton,
        raw_pose: &[Qvv],
        base_pose: &[Qvv],
        lossy_pose: &[Qvv],
        bone_index: u32,
    ) -> f32;

    fn calculate_object_bone_error_no_scale(
        &self,
        skeleton: &Skeleton,
        raw_pose: &[Qvv],
        base_pose: &[Qvv],
        lossy_pose: &[Qvv],
        bone_index: u32,
    ) -> f32;
}

/// The default metric: the worst displacement of two virtual vertices sitting on a shell at the
/// bone's `shell_distance`.
///
/// Two orthogonal vertices are enough to observe every rotation axis: a vertex on the rotation
/// axis itself does not move, but it cannot lie on both X and Y simultaneously.
#[derive(Copy, Clone, Debug, Default)]
pub struct QvvTransformErrorMetric;

impl QvvTransformErrorMetric {
    fn vertices(shell_distance: f32) -> [Vec3; 2] {
        [Vec3::new(shell_distance, 0.0, 0.0), Vec3::new(0.0, shell_distance, 0.0)]
    }

    fn transform_error(raw: &Qvv, lossy: &Qvv, shell_distance: f32, with_scale: bool) -> f32 {
        let mut max_error = 0.0f32;

        for vertex in Self::vertices(shell_distance) {
            let (raw_point, lossy_point) = if with_scale {
                (raw.transform_point(vertex), lossy.transform_point(vertex))
            }
            else {
                (raw.transform_point_no_scale(vertex), lossy.transform_point_no_scale(vertex))
            };

            max_error = max_error.max(raw_point.distance(lossy_point));
        }

        max_error
    }

    /// Accumulates the local transforms along the bone chain into the object-space transform of
    /// `bone_index`.
    fn object_transform(skeleton: &Skeleton, pose: &[Qvv], bone_index: u32, with_scale: bool) -> Qvv {
        let chain = skeleton.bone_chain(bone_index);

        let mut object = Qvv::IDENTITY;
        for &chain_bone_index in chain.iter() {
            let local = &pose[chain_bone_index as usize];
            object = if with_scale { object.mul(local) } else { object.mul_no_scale(local) };
        }

        object
    }
}

impl TransformErrorMetric for QvvTransformErrorMetric {
    fn get_hash(&self) -> u32 {
        hash32(b"QvvTransformErrorMetric")
    }

    fn calculate_local_bone_error(
        &self,
        skeleton: &Skeleton,
        raw_pose: &[Qvv],
        _base_pose: &[Qvv],
        lossy_pose: &[Qvv],
        bone_index: u32,
    ) -> f32 {
        let shell_distance = skeleton.bone(bone_index).shell_distance;
        Self::transform_error(
            &raw_pose[bone_index as usize],
            &lossy_pose[bone_index as usize],
            shell_distance,
            true,
        )
    }

    fn calculate_local_bone_error_no_scale(
        &self,
        skeleton: &Skeleton,
        raw_pose: &[Qvv],
        _base_pose: &[Qvv],
        lossy_pose: &[Qvv],
        bone_index: u32,
    ) -> f32 {
        let shell_distance = skeleton.bone(bone_index).shell_distance;
        Self::transform_error(
            &raw_pose[bone_index as usize],
            &lossy_pose[bone_index as usize],
            shell_distance,
            false,
        )
    }

    fn calculate_object_bone_error(
        &self,
        skeleton: &Skeleton,
        raw_pose: &[Qvv],
        _base_pose: &[Qvv],
        lossy_pose: &[Qvv],
        bone_index: u32,
    ) -> f32 {
        let shell_distance = skeleton.bone(bone_index).shell_distance;
        let raw = Self::object_transform(skeleton, raw_pose, bone_index, true);
        let lossy = Self::object_transform(skeleton, lossy_pose, bone_index, true);
        Self::transform_error(&raw, &lossy, shell_distance, true)
    }

    fn calculate_object_bone_error_no_scale(
        &self,
        skeleton: &Skeleton,
        raw_pose: &[Qvv],
        _base_pose: &[Qvv],
        lossy_pose: &[Qvv],
        bone_index: u32,
    ) -> f32 {
        let shell_distance = skeleton.bone(bone_index).shell_distance;
        let raw = Self::object_transform(skeleton, raw_pose, bone_index, false);
        let lossy = Self::object_transform(skeleton, lossy_pose, bone_index, false);
        Self::transform_error(&raw, &lossy, shell_distance, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracks::{Bone, INVALID_BONE_INDEX};
    use glam::Quat;

    fn chain_skeleton() -> Skeleton {
        Skeleton::new(vec![Bone::new("root", INVALID_BONE_INDEX, 0), Bone::new("tip", 0, 1)])
            .unwrap()
    }

    #[test]
    fn verify_identical_poses_have_zero_error() {
        let skeleton = chain_skeleton();
        let metric = QvvTransformErrorMetric;

        let pose = vec![Qvv::IDENTITY; 2];
        assert_eq!(metric.calculate_local_bone_error(&skeleton, &pose, &[], &pose, 1), 0.0);
        assert_eq!(metric.calculate_object_bone_error(&skeleton, &pose, &[], &pose, 1), 0.0);
    }

    #[test]
    fn verify_parent_error_propagates_to_children() {
        let skeleton = chain_skeleton();
        let metric = QvvTransformErrorMetric;

        let raw_pose = vec![
            Qvv::IDENTITY,
            Qvv::new(Quat::IDENTITY, Vec3::new(10.0, 0.0, 0.0), Vec3::ONE),
        ];

        // Perturb only the root rotation; the child's local transform is untouched.
        let lossy_pose = vec![
            Qvv::new(Quat::from_axis_angle(Vec3::Z, 0.01), Vec3::ZERO, Vec3::ONE),
            raw_pose[1],
        ];

        let child_local = metric.calculate_local_bone_error(&skeleton, &raw_pose, &[], &lossy_pose, 1);
        let child_object = metric.calculate_object_bone_error(&skeleton, &raw_pose, &[], &lossy_pose, 1);

        assert_eq!(child_local, 0.0);
        // The child sits 10 units out; a 0.01 rad lean displaces it by roughly 0.1.
        assert!(child_object > 0.05, "object error: {}", child_object);
    }

    #[test]
    fn verify_translation_error_matches_distance() {
        let skeleton = chain_skeleton();
        let metric = QvvTransformErrorMetric;

        let raw_pose = vec![Qvv::IDENTITY; 2];
        let lossy_pose = vec![
            Qvv::IDENTITY,
            Qvv::new(Quat::IDENTITY, Vec3::new(0.25, 0.0, 0.0), Vec3::ONE),
        ];

        let error = metric.calculate_local_bone_error(&skeleton, &raw_pose, &[], &lossy_pose, 1);
        assert!((error - 0.25).abs() < 1.0e-6);
    }
}
