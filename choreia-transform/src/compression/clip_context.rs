// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `clip_context` module owns the working state of a clip being compressed.
//!
//! A clip context starts as a single segment holding every sample as a full-precision
//! 4-component vector. The pipeline then converts rotations, flags default/constant tracks,
//! range-reduces at the clip level, splits the clip into segments, and range-reduces again per
//! segment. Bone streams hold normalized values from then on; the raw clip context built
//! alongside keeps the original samples for error measurement.

use choreia_core::math::quat_ensure_positive_w;
use choreia_core::units::calculate_duration;

use crate::bit_rate::BoneBitRates;
use crate::compression::range::{fixup_segment_range, normalize_vec4, TrackRange};
use crate::settings::{CompressionSettings, RangeReductionFlags, RotationFormat};
use crate::tracks::RawTrackList;

use glam::{Quat, Vec4};

/// The min/extent ranges of one bone's three channels.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct BoneRanges {
    pub rotation: TrackRange,
    pub translation: TrackRange,
    pub scale: TrackRange,
}

/// One bone's working samples within a segment.
#[derive(Clone, Debug, Default)]
pub(crate) struct BoneStreams {
    pub rotations: Vec<Vec4>,
    pub translations: Vec<Vec4>,
    pub scales: Vec<Vec4>,

    pub is_rotation_default: bool,
    pub is_rotation_constant: bool,
    pub is_translation_default: bool,
    pub is_translation_constant: bool,
    pub is_scale_default: bool,
    pub is_scale_constant: bool,
}

impl BoneStreams {
    #[inline]
    pub fn is_rotation_animated(&self) -> bool {
        !self.is_rotation_constant
    }

    #[inline]
    pub fn is_translation_animated(&self) -> bool {
        !self.is_translation_constant
    }

    #[inline]
    pub fn is_scale_animated(&self) -> bool {
        !self.is_scale_constant
    }
}

/// A contiguous run of samples from one clip.
#[derive(Clone, Debug)]
pub(crate) struct SegmentContext {
    pub bone_streams: Vec<BoneStreams>,
    /// Per-bone segment ranges, valid once extracted. Already rounded to 8 bits per component.
    pub ranges: Vec<BoneRanges>,
    /// Bit rates chosen by the search, valid once quantized.
    pub bit_rates: Vec<BoneBitRates>,

    pub clip_sample_offset: u32,
    pub num_samples: u32,

    pub are_rotations_normalized: bool,
    pub are_translations_normalized: bool,
    pub are_scales_normalized: bool,
}

/// The working state of one clip during compression.
#[derive(Clone, Debug)]
pub(crate) struct ClipContext {
    pub segments: Vec<SegmentContext>,
    /// Per-bone clip-level ranges, valid once extracted.
    pub ranges: Vec<BoneRanges>,

    pub num_bones: u32,
    pub num_samples: u32,
    pub sample_rate: f32,
    pub duration: f32,
    pub has_scale: bool,

    pub are_rotations_normalized: bool,
    pub are_translations_normalized: bool,
    pub are_scales_normalized: bool,
}

fn quat_to_vec4(rotation: Quat) -> Vec4 {
    Vec4::new(rotation.x, rotation.y, rotation.z, rotation.w)
}

impl ClipContext {
    /// Builds a single-segment context holding the raw samples of the track list.
    pub fn from_raw_tracks(track_list: &RawTrackList) -> Self {
        let num_bones = track_list.num_bones();
        let num_samples = track_list.num_samples();

        let mut bone_streams = Vec::with_capacity(num_bones as usize);
        for track in track_list.tracks() {
            bone_streams.push(BoneStreams {
                rotations: track.rotations.iter().map(|&rotation| quat_to_vec4(rotation)).collect(),
                translations: track.translations.iter().map(|&value| value.extend(0.0)).collect(),
                scales: track.scales.iter().map(|&value| value.extend(0.0)).collect(),
                ..BoneStreams::default()
            });
        }

        let segment = SegmentContext {
            bone_streams,
            ranges: Vec::new(),
            bit_rates: vec![BoneBitRates::INVALID; num_bones as usize],
            clip_sample_offset: 0,
            num_samples,
            are_rotations_normalized: false,
            are_translations_normalized: false,
            are_scales_normalized: false,
        };

        ClipContext {
            segments: vec![segment],
            ranges: Vec::new(),
            num_bones,
            num_samples,
            sample_rate: track_list.sample_rate(),
            duration: calculate_duration(num_samples, track_list.sample_rate()),
            has_scale: false,
            are_rotations_normalized: false,
            are_translations_normalized: false,
            are_scales_normalized: false,
        }
    }

    /// Rewrites every rotation sample onto its positive-W representative so the W component can
    /// be dropped.
    pub fn convert_rotations(&mut self, rotation_format: RotationFormat) {
        if rotation_format == RotationFormat::QuatFull {
            return;
        }

        for segment in &mut self.segments {
            for bone_stream in &mut segment.bone_streams {
                for sample in &mut bone_stream.rotations {
                    let rotation =
                        Quat::from_xyzw(sample.x, sample.y, sample.z, sample.w);
                    *sample = quat_to_vec4(quat_ensure_positive_w(rotation));
                }
            }
        }
    }

    /// Flags tracks that are the canonical identity everywhere (default) or that never move
    /// away from their first sample (constant). Must run while the clip is one segment.
    pub fn detect_default_constant_tracks(&mut self, settings: &CompressionSettings) {
        debug_assert_eq!(self.segments.len(), 1);

        let rotation_threshold = settings.constant_rotation_threshold_angle;
        let translation_threshold = settings.constant_translation_threshold;
        let scale_threshold = settings.constant_scale_threshold;

        let mut has_scale = false;

        for bone_stream in &mut self.segments[0].bone_streams {
            let rotation_angle_to = |sample: &Vec4, reference: &Vec4| -> f32 {
                // cos(angle / 2) = |q . ref| for unit quaternions.
                let dot = (sample.dot(*reference)).abs().min(1.0);
                2.0 * dot.acos()
            };

            let identity = quat_to_vec4(Quat::IDENTITY);
            bone_stream.is_rotation_default = bone_stream
                .rotations
                .iter()
                .all(|sample| rotation_angle_to(sample, &identity) <= rotation_threshold);
            bone_stream.is_rotation_constant = bone_stream.is_rotation_default
                || bone_stream
                    .rotations
                    .iter()
                    .all(|sample| rotation_angle_to(sample, &bone_stream.rotations[0]) <= rotation_threshold);

            let distance_to = |sample: &Vec4, reference: Vec4| -> f32 {
                (*sample - reference).truncate().length()
            };

            bone_stream.is_translation_default = bone_stream
                .translations
                .iter()
                .all(|sample| distance_to(sample, Vec4::ZERO) <= translation_threshold);
            bone_stream.is_translation_constant = bone_stream.is_translation_default
                || bone_stream
                    .translations
                    .iter()
                    .all(|sample| distance_to(sample, bone_stream.translations[0]) <= translation_threshold);

            let unit_scale = Vec4::new(1.0, 1.0, 1.0, 0.0);
            bone_stream.is_scale_default = bone_stream
                .scales
                .iter()
                .all(|sample| distance_to(sample, unit_scale) <= scale_threshold);
            bone_stream.is_scale_constant = bone_stream.is_scale_default
                || bone_stream
                    .scales
                    .iter()
                    .all(|sample| distance_to(sample, bone_stream.scales[0]) <= scale_threshold);

            has_scale |= !bone_stream.is_scale_default;
        }

        self.has_scale = has_scale;
    }

    /// Computes the per-bone clip-level ranges. Must run while the clip is one segment.
    pub fn extract_clip_ranges(&mut self) {
        debug_assert_eq!(self.segments.len(), 1);

        let segment = &self.segments[0];
        self.ranges = segment
            .bone_streams
            .iter()
            .map(|bone_stream| BoneRanges {
                rotation: TrackRange::from_samples(&bone_stream.rotations),
                translation: TrackRange::from_samples(&bone_stream.translations),
                scale: TrackRange::from_samples(&bone_stream.scales),
            })
            .collect();
    }

    /// Normalizes animated samples into `[0, 1]` against the clip ranges for every channel
    /// family enabled in `range_reduction`. Must run while the clip is one segment.
    pub fn normalize_clip_streams(&mut self, range_reduction: RangeReductionFlags) {
        debug_assert_eq!(self.segments.len(), 1);
        debug_assert_eq!(self.ranges.len(), self.num_bones as usize);

        let segment = &mut self.segments[0];

        if range_reduction.contains(RangeReductionFlags::ROTATIONS) {
            for (bone_stream, bone_ranges) in segment.bone_streams.iter_mut().zip(self.ranges.iter()) {
                if !bone_stream.is_rotation_animated() {
                    continue;
                }
                for sample in &mut bone_stream.rotations {
                    *sample = normalize_vec4(*sample, &bone_ranges.rotation);
                }
            }
            self.are_rotations_normalized = true;
        }

        if range_reduction.contains(RangeReductionFlags::TRANSLATIONS) {
            for (bone_stream, bone_ranges) in segment.bone_streams.iter_mut().zip(self.ranges.iter()) {
                if !bone_stream.is_translation_animated() {
                    continue;
                }
                for sample in &mut bone_stream.translations {
                    *sample = normalize_vec4(*sample, &bone_ranges.translation);
                }
            }
            self.are_translations_normalized = true;
        }

        if range_reduction.contains(RangeReductionFlags::SCALES) {
            for (bone_stream, bone_ranges) in segment.bone_streams.iter_mut().zip(self.ranges.iter()) {
                if !bone_stream.is_scale_animated() {
                    continue;
                }
                for sample in &mut bone_stream.scales {
                    *sample = normalize_vec4(*sample, &bone_ranges.scale);
                }
            }
            self.are_scales_normalized = true;
        }
    }

    /// Splits the single working segment into segments of at most the configured sample count.
    pub fn split_into_segments(&mut self, settings: &CompressionSettings) {
        debug_assert_eq!(self.segments.len(), 1);

        let segment_lengths = calculate_segment_lengths(
            self.num_samples,
            settings.ideal_num_samples_per_segment,
            settings.max_num_samples_per_segment,
        );

        if segment_lengths.len() <= 1 {
            return;
        }

        let source = self.segments.pop().unwrap();
        let mut segments = Vec::with_capacity(segment_lengths.len());
        let mut clip_sample_offset = 0;

        for num_segment_samples in segment_lengths {
            let start = clip_sample_offset as usize;
            let end = start + num_segment_samples as usize;

            let bone_streams = source
                .bone_streams
                .iter()
                .map(|bone_stream| BoneStreams {
                    rotations: bone_stream.rotations[start..end].to_vec(),
                    translations: bone_stream.translations[start..end].to_vec(),
                    scales: bone_stream.scales[start..end].to_vec(),
                    ..*bone_stream
                })
                .collect();

            segments.push(SegmentContext {
                bone_streams,
                ranges: Vec::new(),
                bit_rates: vec![BoneBitRates::INVALID; self.num_bones as usize],
                clip_sample_offset,
                num_samples: num_segment_samples,
                are_rotations_normalized: false,
                are_translations_normalized: false,
                are_scales_normalized: false,
            });

            clip_sample_offset += num_segment_samples;
        }

        self.segments = segments;
    }

    /// Computes per-segment ranges rounded to 8 bits per component and normalizes the segment
    /// samples against them. Only meaningful with more than one segment; the runtime re-applies
    /// segment ranges at a fixed 8-bit precision.
    pub fn extract_and_normalize_segment_ranges(&mut self) {
        if self.segments.len() <= 1 {
            return;
        }

        let are_rotations_normalized = self.are_rotations_normalized;
        let are_translations_normalized = self.are_translations_normalized;
        let are_scales_normalized = self.are_scales_normalized;

        for segment in &mut self.segments {
            let mut ranges = vec![BoneRanges::default(); segment.bone_streams.len()];

            for (bone_stream, bone_ranges) in segment.bone_streams.iter_mut().zip(ranges.iter_mut()) {
                if are_rotations_normalized && bone_stream.is_rotation_animated() {
                    bone_ranges.rotation =
                        fixup_segment_range(&TrackRange::from_samples(&bone_stream.rotations));
                    for sample in &mut bone_stream.rotations {
                        *sample = normalize_vec4(*sample, &bone_ranges.rotation);
                    }
                }

                if are_translations_normalized && bone_stream.is_translation_animated() {
                    bone_ranges.translation =
                        fixup_segment_range(&TrackRange::from_samples(&bone_stream.translations));
                    for sample in &mut bone_stream.translations {
                        *sample = normalize_vec4(*sample, &bone_ranges.translation);
                    }
                }

                if are_scales_normalized && bone_stream.is_scale_animated() {
                    bone_ranges.scale =
                        fixup_segment_range(&TrackRange::from_samples(&bone_stream.scales));
                    for sample in &mut bone_stream.scales {
                        *sample = normalize_vec4(*sample, &bone_ranges.scale);
                    }
                }
            }

            segment.ranges = ranges;
            segment.are_rotations_normalized = are_rotations_normalized;
            segment.are_translations_normalized = are_translations_normalized;
            segment.are_scales_normalized = are_scales_normalized;
        }
    }
}

/// Packs samples into segments left to right: each segment gets the ideal count until fewer
/// remain. A trailing remainder of one sample is folded into the previous segment so every
/// multi-sample segment keeps its two immovable anchor frames.
pub(crate) fn calculate_segment_lengths(num_samples: u32, ideal: u32, max: u32) -> Vec<u32> {
    debug_assert!(ideal >= 2 && ideal <= max);

    if num_samples <= ideal {
        if num_samples == 0 {
            return Vec::new();
        }
        return vec![num_samples];
    }

    let mut lengths = Vec::new();
    let mut remaining = num_samples;

    while remaining > 0 {
        if remaining >= ideal {
            lengths.push(ideal);
            remaining -= ideal;
        }
        else {
            if remaining == 1 {
                // A one-sample segment cannot anchor interpolation at its boundaries.
                *lengths.last_mut().unwrap() += 1;
            }
            else {
                lengths.push(remaining);
            }
            remaining = 0;
        }
    }

    debug_assert!(lengths.iter().all(|&len| len <= max));
    lengths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracks::{Bone, Skeleton, TransformTrack, INVALID_BONE_INDEX};
    use glam::Vec3;

    fn make_track_list(num_samples: u32) -> RawTrackList {
        let skeleton =
            Skeleton::new(vec![Bone::new("root", INVALID_BONE_INDEX, 0)]).unwrap();

        let track = TransformTrack {
            rotations: vec![Quat::IDENTITY; num_samples as usize],
            translations: (0..num_samples).map(|i| Vec3::new(i as f32, 0.0, 0.0)).collect(),
            scales: vec![Vec3::ONE; num_samples as usize],
        };

        RawTrackList::new(skeleton, vec![track], 30.0, num_samples).unwrap()
    }

    #[test]
    fn verify_segment_lengths() {
        assert_eq!(calculate_segment_lengths(0, 16, 32), Vec::<u32>::new());
        assert_eq!(calculate_segment_lengths(1, 16, 32), vec![1]);
        assert_eq!(calculate_segment_lengths(16, 16, 32), vec![16]);
        assert_eq!(calculate_segment_lengths(64, 16, 32), vec![16, 16, 16, 16]);
        assert_eq!(calculate_segment_lengths(30, 16, 32), vec![16, 14]);

        // A trailing single sample folds into the previous segment.
        assert_eq!(calculate_segment_lengths(33, 16, 32), vec![16, 17]);
    }

    #[test]
    fn verify_default_and_constant_detection() {
        let track_list = make_track_list(4);
        let mut context = ClipContext::from_raw_tracks(&track_list);
        context.detect_default_constant_tracks(&CompressionSettings::default());

        let bone_stream = &context.segments[0].bone_streams[0];
        assert!(bone_stream.is_rotation_default);
        assert!(bone_stream.is_rotation_constant);
        assert!(!bone_stream.is_translation_default);
        assert!(!bone_stream.is_translation_constant);
        assert!(bone_stream.is_scale_default);
        assert!(!context.has_scale);
    }

    #[test]
    fn verify_split_preserves_samples() {
        let track_list = make_track_list(40);
        let mut context = ClipContext::from_raw_tracks(&track_list);
        context.split_into_segments(&CompressionSettings::default());

        assert_eq!(context.segments.len(), 3);
        assert_eq!(context.segments[0].clip_sample_offset, 0);
        assert_eq!(context.segments[1].clip_sample_offset, 16);
        assert_eq!(context.segments[2].clip_sample_offset, 32);
        assert_eq!(context.segments[2].num_samples, 8);

        // Sample 17 of the clip is sample 1 of the second segment.
        let translation = context.segments[1].bone_streams[0].translations[1];
        assert_eq!(translation.x, 17.0);
    }

    #[test]
    fn verify_clip_normalization_round_trips() {
        let track_list = make_track_list(8);
        let mut context = ClipContext::from_raw_tracks(&track_list);
        context.detect_default_constant_tracks(&CompressionSettings::default());
        context.extract_clip_ranges();
        context.normalize_clip_streams(RangeReductionFlags::all());

        assert!(context.are_translations_normalized);

        let range = &context.ranges[0].translation;
        let bone_stream = &context.segments[0].bone_streams[0];
        for (sample_index, sample) in bone_stream.translations.iter().enumerate() {
            assert!(sample.x >= 0.0 && sample.x <= 1.0);
            let restored = sample.x * range.extent.x + range.min.x;
            assert!((restored - sample_index as f32).abs() < 1.0e-4);
        }
    }
}
