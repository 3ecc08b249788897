// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `tracks` module defines the raw, uncompressed clip model handed to the compressor.

use choreia_core::errors::{invalid_input_error, Result};
use choreia_core::math::{quat_nlerp, Qvv};
use choreia_core::units::{calculate_duration, find_interpolation_keys, SampleRoundingPolicy};

use glam::{Quat, Vec3};
use smallvec::SmallVec;

/// Sentinel parent index marking a root bone.
pub const INVALID_BONE_INDEX: u32 = u32::MAX;

/// Sentinel output index for bones whose pose is not written out.
pub const OUTPUT_INDEX_STRIPPED: u32 = u32::MAX;

/// A named joint of a skeleton.
#[derive(Clone, Debug)]
pub struct Bone {
    pub name: String,
    /// Index of the parent bone, or [`INVALID_BONE_INDEX`] for a root.
    pub parent_index: u32,
    /// Position of this bone in the caller-visible pose, or [`OUTPUT_INDEX_STRIPPED`].
    pub output_index: u32,
    /// Distance of the virtual vertices used by the error metric, in the same unit as
    /// translations. Roughly the distance at which the bone visually matters.
    pub shell_distance: f32,
}

impl Bone {
    pub fn new(name: impl Into<String>, parent_index: u32, output_index: u32) -> Self {
        Bone { name: name.into(), parent_index, output_index, shell_distance: 3.0 }
    }
}

/// An ordered set of bones. Parents always precede their children.
#[derive(Clone, Debug)]
pub struct Skeleton {
    bones: Vec<Bone>,
}

impl Skeleton {
    pub fn new(bones: Vec<Bone>) -> Result<Self> {
        for (bone_index, bone) in bones.iter().enumerate() {
            if bone.parent_index != INVALID_BONE_INDEX
                && bone.parent_index as usize >= bone_index
            {
                return invalid_input_error("skeleton parents must precede their children");
            }
        }

        Ok(Skeleton { bones })
    }

    #[inline]
    pub fn num_bones(&self) -> u32 {
        self.bones.len() as u32
    }

    #[inline]
    pub fn bone(&self, bone_index: u32) -> &Bone {
        &self.bones[bone_index as usize]
    }

    #[inline]
    pub fn bones(&self) -> &[Bone] {
        &self.bones
    }

    #[inline]
    pub fn is_root(&self, bone_index: u32) -> bool {
        self.bones[bone_index as usize].parent_index == INVALID_BONE_INDEX
    }

    /// Returns the bone chain from the root down to `bone_index` inclusive, root first.
    pub fn bone_chain(&self, bone_index: u32) -> SmallVec<[u32; 16]> {
        let mut chain = SmallVec::new();

        let mut current = bone_index;
        loop {
            chain.push(current);
            let parent = self.bones[current as usize].parent_index;
            if parent == INVALID_BONE_INDEX {
                break;
            }
            current = parent;
        }

        chain.reverse();
        chain
    }
}

/// The keyframes of a single bone, all sampled on the clip's uniform grid.
#[derive(Clone, Debug, Default)]
pub struct TransformTrack {
    pub rotations: Vec<Quat>,
    pub translations: Vec<Vec3>,
    pub scales: Vec<Vec3>,
}

/// A raw clip: a skeleton and one transform track per bone, uniformly sampled.
#[derive(Clone, Debug)]
pub struct RawTrackList {
    skeleton: Skeleton,
    tracks: Vec<TransformTrack>,
    sample_rate: f32,
    num_samples: u32,
}

impl RawTrackList {
    pub fn new(
        skeleton: Skeleton,
        tracks: Vec<TransformTrack>,
        sample_rate: f32,
        num_samples: u32,
    ) -> Result<Self> {
        if tracks.len() != skeleton.num_bones() as usize {
            return invalid_input_error("expected one track per bone");
        }

        if !(sample_rate > 0.0) || !sample_rate.is_finite() {
            return invalid_input_error("sample rate must be finite and positive");
        }

        for track in &tracks {
            if track.rotations.len() != num_samples as usize
                || track.translations.len() != num_samples as usize
                || track.scales.len() != num_samples as usize
            {
                return invalid_input_error("every channel must carry num_samples keyframes");
            }
        }

        Ok(RawTrackList { skeleton, tracks, sample_rate, num_samples })
    }

    #[inline]
    pub fn skeleton(&self) -> &Skeleton {
        &self.skeleton
    }

    #[inline]
    pub fn tracks(&self) -> &[TransformTrack] {
        &self.tracks
    }

    #[inline]
    pub fn track(&self, bone_index: u32) -> &TransformTrack {
        &self.tracks[bone_index as usize]
    }

    #[inline]
    pub fn num_bones(&self) -> u32 {
        self.skeleton.num_bones()
    }

    #[inline]
    pub fn num_samples(&self) -> u32 {
        self.num_samples
    }

    #[inline]
    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// The clip duration in seconds. A single-sample clip is a static pose with an infinite
    /// duration.
    #[inline]
    pub fn duration(&self) -> f32 {
        calculate_duration(self.num_samples, self.sample_rate)
    }

    /// Samples the local pose at `sample_time` with linear interpolation (normalized lerp for
    /// rotations), writing one transform per bone.
    pub fn sample_pose(&self, sample_time: f32, out_pose: &mut [Qvv]) {
        debug_assert_eq!(out_pose.len(), self.tracks.len());

        let keys = find_interpolation_keys(
            self.num_samples,
            self.sample_rate,
            sample_time,
            SampleRoundingPolicy::None,
        );

        for (track, out) in self.tracks.iter().zip(out_pose.iter_mut()) {
            let key0 = keys.key0 as usize;
            let key1 = keys.key1 as usize;

            out.rotation = quat_nlerp(track.rotations[key0], track.rotations[key1], keys.alpha);
            out.translation = track.translations[key0].lerp(track.translations[key1], keys.alpha);
            out.scale = track.scales[key0].lerp(track.scales[key1], keys.alpha);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_bone_skeleton() -> Skeleton {
        Skeleton::new(vec![Bone::new("root", INVALID_BONE_INDEX, 0), Bone::new("child", 0, 1)])
            .unwrap()
    }

    #[test]
    fn verify_parent_ordering_is_enforced() {
        let result = Skeleton::new(vec![Bone::new("child", 1, 0), Bone::new("root", INVALID_BONE_INDEX, 1)]);
        assert!(result.is_err());
    }

    #[test]
    fn verify_bone_chain() {
        let skeleton = Skeleton::new(vec![
            Bone::new("root", INVALID_BONE_INDEX, 0),
            Bone::new("spine", 0, 1),
            Bone::new("arm", 1, 2),
            Bone::new("leg", 0, 3),
        ])
        .unwrap();

        assert_eq!(skeleton.bone_chain(2).as_slice(), &[0, 1, 2]);
        assert_eq!(skeleton.bone_chain(3).as_slice(), &[0, 3]);
        assert_eq!(skeleton.bone_chain(0).as_slice(), &[0]);
    }

    #[test]
    fn verify_track_validation() {
        let skeleton = two_bone_skeleton();

        let track = TransformTrack {
            rotations: vec![Quat::IDENTITY; 3],
            translations: vec![Vec3::ZERO; 3],
            scales: vec![Vec3::ONE; 3],
        };

        assert!(RawTrackList::new(skeleton.clone(), vec![track.clone(); 2], 30.0, 3).is_ok());
        assert!(RawTrackList::new(skeleton.clone(), vec![track.clone()], 30.0, 3).is_err());
        assert!(RawTrackList::new(skeleton, vec![track; 2], 0.0, 3).is_err());
    }

    #[test]
    fn verify_sample_pose_interpolates() {
        let skeleton = two_bone_skeleton();

        let mut track = TransformTrack {
            rotations: vec![Quat::IDENTITY; 2],
            translations: vec![Vec3::ZERO, Vec3::new(2.0, 0.0, 0.0)],
            scales: vec![Vec3::ONE; 2],
        };
        let static_track = TransformTrack {
            rotations: vec![Quat::IDENTITY; 2],
            translations: vec![Vec3::ZERO; 2],
            scales: vec![Vec3::ONE; 2],
        };
        track.translations[0] = Vec3::ZERO;

        let track_list =
            RawTrackList::new(skeleton, vec![static_track, track], 30.0, 2).unwrap();

        let mut pose = [Qvv::IDENTITY; 2];
        track_list.sample_pose(0.5 / 30.0, &mut pose);
        assert!(pose[1].translation.abs_diff_eq(Vec3::new(1.0, 0.0, 0.0), 1.0e-5));
    }
}
