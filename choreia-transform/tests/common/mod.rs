// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared fixtures for the end-to-end suites.

// Each suite compiles this module separately and uses a different subset of it.
#![allow(dead_code)]

use choreia_transform::{Bone, PoseWriter, RawTrackList, Skeleton, TransformTrack};

use glam::{Quat, Vec3};

pub const INVALID_BONE_INDEX: u32 = u32::MAX;

/// A pose writer collecting every channel into vectors.
pub struct BufferedPose {
    pub rotations: Vec<Quat>,
    pub translations: Vec<Vec3>,
    pub scales: Vec<Vec3>,
}

impl BufferedPose {
    pub fn new(num_tracks: usize) -> Self {
        BufferedPose {
            rotations: vec![Quat::IDENTITY; num_tracks],
            translations: vec![Vec3::ZERO; num_tracks],
            scales: vec![Vec3::ONE; num_tracks],
        }
    }
}

impl PoseWriter for BufferedPose {
    fn write_rotation(&mut self, track_index: u32, rotation: Quat) {
        self.rotations[track_index as usize] = rotation;
    }

    fn write_translation(&mut self, track_index: u32, translation: Vec3) {
        self.translations[track_index as usize] = translation;
    }

    fn write_scale(&mut self, track_index: u32, scale: Vec3) {
        self.scales[track_index as usize] = scale;
    }
}

/// A chain skeleton `root -> bone 1 -> bone 2 -> ...` with identity output mapping.
pub fn chain_skeleton(num_bones: u32) -> Skeleton {
    let bones = (0..num_bones)
        .map(|bone_index| {
            let parent = if bone_index == 0 { INVALID_BONE_INDEX } else { bone_index - 1 };
            Bone::new(format!("bone_{}", bone_index), parent, bone_index)
        })
        .collect();
    Skeleton::new(bones).unwrap()
}

pub fn static_track(num_samples: usize) -> TransformTrack {
    TransformTrack {
        rotations: vec![Quat::IDENTITY; num_samples],
        translations: vec![Vec3::ZERO; num_samples],
        scales: vec![Vec3::ONE; num_samples],
    }
}

/// A clip waving each bone around Y while translating it along X, detailed enough that every
/// track is animated.
pub fn waving_track_list(num_bones: u32, num_samples: u32, sample_rate: f32) -> RawTrackList {
    let skeleton = chain_skeleton(num_bones);

    let tracks = (0..num_bones)
        .map(|bone_index| {
            let phase = bone_index as f32 * 0.7;
            TransformTrack {
                rotations: (0..num_samples)
                    .map(|sample| {
                        let angle = 0.9 * ((sample as f32 * 0.2) + phase).sin();
                        Quat::from_axis_angle(Vec3::Y, angle)
                    })
                    .collect(),
                translations: (0..num_samples)
                    .map(|sample| {
                        Vec3::new(
                            1.0 + ((sample as f32 * 0.15) + phase).cos(),
                            0.25 * bone_index as f32,
                            0.0,
                        )
                    })
                    .collect(),
                scales: vec![Vec3::ONE; num_samples as usize],
            }
        })
        .collect();

    RawTrackList::new(skeleton, tracks, sample_rate, num_samples).unwrap()
}

/// The angle between two rotations, in radians.
pub fn angular_error(lhs: Quat, rhs: Quat) -> f32 {
    let dot = lhs.dot(rhs).abs().min(1.0);
    2.0 * dot.acos()
}
