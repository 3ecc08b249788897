// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `contributing_error` module predicts the pose error each keyframe's removal would add.
//!
//! The streaming database decides which keyframes to move out-of-band by their contributing
//! error: a dropped frame is reconstructed at runtime by interpolating its surviving
//! neighbors, so the contribution of frame `k` is the worst object-space error of that
//! reconstruction against the raw pose at `k`. Anchor frames (first and last of a segment) are
//! immovable and carry an infinite contribution.

use choreia_core::math::Qvv;

use crate::compression::clip_context::ClipContext;
use crate::compression::quantize::interpolate_qvv;
use crate::compression::sample_cache::{DecodeArgs, SampleCache};
use crate::error_metric::TransformErrorMetric;
use crate::settings::CompressionSettings;
use crate::tracks::Skeleton;

use glam::Vec4;

/// Decodes the final (post-search) transform of every bone at one segment sample.
fn decode_pose(
    cache: &mut SampleCache,
    args: &DecodeArgs<'_>,
    sample_index: u32,
    out_pose: &mut [Qvv],
) {
    let segment = &args.lossy.segments[args.segment_index];

    for (bone_index, out) in out_pose.iter_mut().enumerate() {
        let bit_rates = segment.bit_rates[bone_index];
        let bone_index = bone_index as u32;

        let rotation = cache.sample_rotation(args, bone_index, sample_index, bit_rates.rotation);
        let translation =
            cache.sample_translation(args, bone_index, sample_index, bit_rates.translation);
        let scale = if args.lossy.has_scale {
            cache.sample_scale(args, bone_index, sample_index, bit_rates.scale)
        }
        else {
            Vec4::new(1.0, 1.0, 1.0, 0.0)
        };

        *out = Qvv::new(rotation, translation.truncate(), scale.truncate());
    }
}

fn raw_pose(raw: &ClipContext, clip_sample_index: u32, out_pose: &mut [Qvv]) {
    use choreia_core::math::vec4_to_quat;

    for (bone_index, out) in out_pose.iter_mut().enumerate() {
        let stream = &raw.segments[0].bone_streams[bone_index];
        *out = Qvv::new(
            vec4_to_quat(stream.rotations[clip_sample_index as usize]).normalize(),
            stream.translations[clip_sample_index as usize].truncate(),
            stream.scales[clip_sample_index as usize].truncate(),
        );
    }
}

/// Computes, per segment, every frame's contributing error sorted ascending. The returned
/// layout matches the metadata block: one `(segment_frame_index, error)` entry per frame.
pub(crate) fn calculate_contributing_error(
    lossy: &ClipContext,
    raw: &ClipContext,
    skeleton: &Skeleton,
    settings: &CompressionSettings,
    metric: &dyn TransformErrorMetric,
) -> Vec<Vec<(u32, f32)>> {
    let num_bones = lossy.num_bones as usize;
    let mut cache = SampleCache::new(lossy.num_bones, lossy.has_scale, 0);

    let mut raw_pose_buf = vec![Qvv::IDENTITY; num_bones];
    let mut prev_pose = vec![Qvv::IDENTITY; num_bones];
    let mut next_pose = vec![Qvv::IDENTITY; num_bones];
    let mut lossy_pose = vec![Qvv::IDENTITY; num_bones];

    let mut per_segment = Vec::with_capacity(lossy.segments.len());

    for segment_index in 0..lossy.segments.len() {
        let segment = &lossy.segments[segment_index];
        let num_samples = segment.num_samples;
        cache.reset(num_samples);

        let args = DecodeArgs { lossy, raw, segment_index, settings };

        let mut entries: Vec<(u32, f32)> = Vec::with_capacity(num_samples as usize);

        for frame_index in 0..num_samples {
            // Anchor frames cannot be removed.
            if frame_index == 0 || frame_index + 1 == num_samples {
                entries.push((frame_index, f32::INFINITY));
                continue;
            }

            decode_pose(&mut cache, &args, frame_index - 1, &mut prev_pose);
            decode_pose(&mut cache, &args, frame_index + 1, &mut next_pose);
            raw_pose(raw, segment.clip_sample_offset + frame_index, &mut raw_pose_buf);

            // Uniform sampling: the removed frame sits halfway between its neighbors.
            for bone_index in 0..num_bones {
                lossy_pose[bone_index] =
                    interpolate_qvv(&prev_pose[bone_index], &next_pose[bone_index], 0.5);
            }

            let mut max_error = 0.0f32;
            for bone_index in 0..num_bones as u32 {
                let error = if lossy.has_scale {
                    metric.calculate_object_bone_error(
                        skeleton,
                        &raw_pose_buf,
                        &[],
                        &lossy_pose,
                        bone_index,
                    )
                }
                else {
                    metric.calculate_object_bone_error_no_scale(
                        skeleton,
                        &raw_pose_buf,
                        &[],
                        &lossy_pose,
                        bone_index,
                    )
                };
                max_error = max_error.max(error);
            }

            entries.push((frame_index, max_error));
        }

        // Lowest contribution first; ties resolve to the earliest frame.
        entries.sort_by(|lhs, rhs| {
            lhs.1.partial_cmp(&rhs.1).unwrap().then_with(|| lhs.0.cmp(&rhs.0))
        });

        per_segment.push(entries);
    }

    per_segment
}
