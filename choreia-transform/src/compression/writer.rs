// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `writer` module emits the final compressed tracks buffer.
//!
//! The layout is computed arithmetically first, then filled linearly; every section start is
//! asserted against the precomputed offset so the writer and the layout cannot drift apart.

use choreia_core::bitset::{bitset_set, BitsetDescription};
use choreia_core::buf::AlignedBuf;
use choreia_core::checksum::hash32;
use choreia_core::io::BitWriterLtr;
use choreia_core::math::{pack_scalar_unsigned, quat_ensure_positive_w, vec4_to_quat};

use crate::bit_rate::{
    is_constant_bit_rate, is_raw_bit_rate, num_bits_at_bit_rate, CONSTANT_BIT_RATE_NUM_BITS,
    INVALID_BIT_RATE,
};
use crate::compression::clip_context::{BoneStreams, ClipContext, SegmentContext};
use crate::compression::range::normalize_vec4;
use crate::container::{
    align_to, tracks_flags, RawBufferHeader, SegmentHeader, TracksHeader, TransformTracksHeader,
    COMPRESSED_TRACKS_TAG, COMPRESSED_TRACKS_VERSION_LATEST, RAW_BUFFER_HEADER_SIZE, SIMD_PADDING,
    TRANSFORM_HEADER_OFFSET, TRANSFORM_TRACKS_HEADER_SIZE,
};
use crate::container::CompressedTracksBuf;
use crate::settings::{CompressionSettings, RangeReductionFlags, RotationFormat, VectorFormat};
use crate::tracks::RawTrackList;

use glam::Vec4;
use log::debug;

/// The channel of a sub-track, in sub-track order within a bone.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SubTrackChannel {
    Rotation,
    Translation,
    Scale,
}

impl SubTrackChannel {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            SubTrackChannel::Rotation => 0,
            SubTrackChannel::Translation => 1,
            SubTrackChannel::Scale => 2,
        }
    }
}

/// One animated (non-constant, non-default) sub-track, in storage order.
#[derive(Copy, Clone, Debug)]
pub(crate) struct AnimatedSubTrack {
    pub bone_index: u32,
    pub channel: SubTrackChannel,
}

/// Enumerates the animated sub-tracks of a clip in storage order: per bone, rotation then
/// translation then scale.
pub(crate) fn animated_sub_tracks(clip: &ClipContext) -> Vec<AnimatedSubTrack> {
    let mut sub_tracks = Vec::new();

    for (bone_index, bone_stream) in clip.segments[0].bone_streams.iter().enumerate() {
        if bone_stream.is_rotation_animated() {
            sub_tracks
                .push(AnimatedSubTrack { bone_index: bone_index as u32, channel: SubTrackChannel::Rotation });
        }
        if bone_stream.is_translation_animated() {
            sub_tracks.push(AnimatedSubTrack {
                bone_index: bone_index as u32,
                channel: SubTrackChannel::Translation,
            });
        }
        if clip.has_scale && bone_stream.is_scale_animated() {
            sub_tracks
                .push(AnimatedSubTrack { bone_index: bone_index as u32, channel: SubTrackChannel::Scale });
        }
    }

    sub_tracks
}

fn channel_num_components(channel: SubTrackChannel, rotation_format: RotationFormat) -> u32 {
    match channel {
        SubTrackChannel::Rotation => rotation_format.num_components(),
        _ => 3,
    }
}

fn channel_is_variable(channel: SubTrackChannel, settings: &CompressionSettings) -> bool {
    match channel {
        SubTrackChannel::Rotation => settings.rotation_format.is_variable(),
        SubTrackChannel::Translation => settings.translation_format.is_variable(),
        SubTrackChannel::Scale => settings.scale_format.is_variable(),
    }
}

fn channel_range_reduced(channel: SubTrackChannel, range_reduction: RangeReductionFlags) -> bool {
    match channel {
        SubTrackChannel::Rotation => range_reduction.contains(RangeReductionFlags::ROTATIONS),
        SubTrackChannel::Translation => range_reduction.contains(RangeReductionFlags::TRANSLATIONS),
        SubTrackChannel::Scale => range_reduction.contains(RangeReductionFlags::SCALES),
    }
}

fn sub_track_bit_rate(segment: &SegmentContext, sub_track: &AnimatedSubTrack) -> u8 {
    let bit_rates = &segment.bit_rates[sub_track.bone_index as usize];
    match sub_track.channel {
        SubTrackChannel::Rotation => bit_rates.rotation,
        SubTrackChannel::Translation => bit_rates.translation,
        SubTrackChannel::Scale => bit_rates.scale,
    }
}

/// Bits one keyframe of this sub-track occupies in the animated stream.
pub(crate) fn sub_track_frame_bit_size(
    channel: SubTrackChannel,
    bit_rate: u8,
    settings_rotation_format: RotationFormat,
    settings_translation_format: VectorFormat,
    settings_scale_format: VectorFormat,
) -> u32 {
    let is_variable = match channel {
        SubTrackChannel::Rotation => settings_rotation_format.is_variable(),
        SubTrackChannel::Translation => settings_translation_format.is_variable(),
        SubTrackChannel::Scale => settings_scale_format.is_variable(),
    };

    if is_variable {
        debug_assert!(bit_rate != INVALID_BIT_RATE);
        if is_constant_bit_rate(bit_rate) {
            0
        }
        else {
            3 * num_bits_at_bit_rate(bit_rate)
        }
    }
    else {
        match channel {
            SubTrackChannel::Rotation => {
                if settings_rotation_format == RotationFormat::QuatFull {
                    128
                }
                else {
                    96
                }
            }
            _ => 96,
        }
    }
}

struct TracksLayout {
    transform_header: TransformTracksHeader,
    segment_headers: Vec<SegmentHeader>,
    metadata_offset: u32,
    total_size: usize,
    animated: Vec<AnimatedSubTrack>,
    num_sub_tracks: u32,
}

fn compute_layout(
    clip: &ClipContext,
    settings: &CompressionSettings,
    has_output_remap: bool,
    include_metadata: bool,
) -> TracksLayout {
    let animated = animated_sub_tracks(clip);
    let num_segments = clip.segments.len() as u32;
    let num_sub_tracks_per_track = if clip.has_scale { 3u32 } else { 2 };
    let num_sub_tracks = clip.num_bones * num_sub_tracks_per_track;
    let bitset_bytes = BitsetDescription::with_num_bits(num_sub_tracks).num_bytes() as usize;

    let mut offset = TRANSFORM_TRACKS_HEADER_SIZE;
    let mut transform_header = TransformTracksHeader::zeroed_with(num_segments);

    if num_segments > 1 {
        offset = align_to(offset, 4);
        transform_header.segment_start_indices_offset = offset as u32;
        offset += 4 * (num_segments as usize + 1);
    }

    offset = align_to(offset, 4);
    transform_header.segment_headers_offset = offset as u32;
    offset += std::mem::size_of::<SegmentHeader>() * num_segments as usize;

    offset = align_to(offset, 4);
    transform_header.default_bitset_offset = offset as u32;
    offset += bitset_bytes;
    transform_header.constant_bitset_offset = offset as u32;
    offset += bitset_bytes;

    if has_output_remap {
        offset = align_to(offset, 4);
        transform_header.output_indices_offset = offset as u32;
        offset += 4 * clip.num_bones as usize;
    }

    offset = align_to(offset, 4);
    transform_header.constant_track_data_offset = offset as u32;
    for bone_stream in &clip.segments[0].bone_streams {
        offset += constant_track_float_count(bone_stream, clip.has_scale, settings) * 4;
    }

    offset = align_to(offset, 4);
    transform_header.clip_range_data_offset = offset as u32;
    for sub_track in &animated {
        if channel_range_reduced(sub_track.channel, settings.range_reduction) {
            let num_components = channel_num_components(sub_track.channel, settings.rotation_format);
            offset += 2 * num_components as usize * 4;
        }
    }

    transform_header.animated_group_types_offset = offset as u32;
    offset += animated.len();

    // Per-segment data blocks.
    let mut segment_headers = Vec::with_capacity(num_segments as usize);
    for segment in &clip.segments {
        let segment_data_offset = offset;

        // Per-track bit rates.
        offset += animated.len();

        // Segment range data, present with multiple segments.
        if num_segments > 1 {
            offset = align_to(offset, 2);
            for sub_track in &animated {
                if channel_range_reduced(sub_track.channel, settings.range_reduction) {
                    let num_components =
                        channel_num_components(sub_track.channel, settings.rotation_format);
                    offset += 2 * num_components as usize;
                }
            }
        }

        let mut animated_pose_bit_size = 0u32;
        for sub_track in &animated {
            animated_pose_bit_size += sub_track_frame_bit_size(
                sub_track.channel,
                sub_track_bit_rate(segment, sub_track),
                settings.rotation_format,
                settings.translation_format,
                settings.scale_format,
            );
        }

        offset = align_to(offset, 4);
        let animated_bits = segment.num_samples as u64 * animated_pose_bit_size as u64;
        offset += ((animated_bits + 7) / 8) as usize;

        debug_assert!(segment.num_samples <= 32);
        let sample_indices = if segment.num_samples >= 32 {
            u32::MAX
        }
        else {
            (1u32 << segment.num_samples) - 1
        };

        segment_headers.push(SegmentHeader {
            animated_pose_bit_size,
            segment_data_offset: segment_data_offset as u32,
            sample_indices,
        });
    }

    // Trailing padding so the decompressor can perform wide unaligned loads at any frame.
    offset += SIMD_PADDING;

    let mut metadata_offset = 0u32;
    if include_metadata {
        offset = align_to(offset, 4);
        metadata_offset = offset as u32;
        offset += 8 * clip.num_samples as usize;
        // The last four bytes of the buffer locate the metadata block.
        offset += 4;
    }

    TracksLayout {
        transform_header,
        segment_headers,
        metadata_offset,
        total_size: TRANSFORM_HEADER_OFFSET + offset,
        animated,
        num_sub_tracks,
    }
}

impl TransformTracksHeader {
    fn zeroed_with(num_segments: u32) -> Self {
        TransformTracksHeader { num_segments, ..bytemuck::Zeroable::zeroed() }
    }
}

/// Floats of constant track data this bone contributes.
fn constant_track_float_count(
    bone_stream: &BoneStreams,
    has_scale: bool,
    settings: &CompressionSettings,
) -> usize {
    let mut count = 0;

    if bone_stream.is_rotation_constant && !bone_stream.is_rotation_default {
        count += settings.rotation_format.num_components() as usize;
    }
    if bone_stream.is_translation_constant && !bone_stream.is_translation_default {
        count += 3;
    }
    if has_scale && bone_stream.is_scale_constant && !bone_stream.is_scale_default {
        count += 3;
    }

    count
}

/// A linear byte writer with alignment padding and position assertions.
pub(crate) struct ByteWriter<'a> {
    bytes: &'a mut [u8],
    pub(crate) position: usize,
}

impl<'a> ByteWriter<'a> {
    pub(crate) fn new(bytes: &'a mut [u8]) -> Self {
        ByteWriter { bytes, position: 0 }
    }

    pub(crate) fn align(&mut self, alignment: usize) {
        self.position = align_to(self.position, alignment);
    }

    pub(crate) fn expect_position(&self, expected: usize) {
        debug_assert_eq!(self.position, expected, "layout and writer drifted apart");
    }

    pub(crate) fn write_bytes(&mut self, data: &[u8]) {
        self.bytes[self.position..self.position + data.len()].copy_from_slice(data);
        self.position += data.len();
    }

    pub(crate) fn write_u8(&mut self, value: u8) {
        self.bytes[self.position] = value;
        self.position += 1;
    }

    pub(crate) fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub(crate) fn write_f32(&mut self, value: f32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub(crate) fn write_pod<T: bytemuck::Pod>(&mut self, value: &T) {
        self.write_bytes(bytemuck::bytes_of(value));
    }

    pub(crate) fn skip_to(&mut self, position: usize) {
        debug_assert!(position >= self.position);
        self.position = position;
    }
}

fn sub_track_stream<'a>(bone_stream: &'a BoneStreams, channel: SubTrackChannel) -> &'a [Vec4] {
    match channel {
        SubTrackChannel::Rotation => &bone_stream.rotations,
        SubTrackChannel::Translation => &bone_stream.translations,
        SubTrackChannel::Scale => &bone_stream.scales,
    }
}

/// Emits the compressed buffer for a fully quantized clip context.
pub(crate) fn write_compressed_tracks(
    lossy: &ClipContext,
    raw: &ClipContext,
    track_list: &RawTrackList,
    settings: &CompressionSettings,
    contributing_errors: Option<&[Vec<(u32, f32)>]>,
) -> CompressedTracksBuf {
    let has_output_remap = track_list
        .skeleton()
        .bones()
        .iter()
        .enumerate()
        .any(|(bone_index, bone)| bone.output_index != bone_index as u32);

    let include_metadata = contributing_errors.is_some();
    let layout = compute_layout(lossy, settings, has_output_remap, include_metadata);

    let mut flags = 0u16;
    if lossy.has_scale {
        flags |= tracks_flags::HAS_SCALE;
    }
    if include_metadata {
        flags |= tracks_flags::HAS_METADATA;
    }
    if has_output_remap {
        flags |= tracks_flags::HAS_OUTPUT_REMAP;
    }

    let mut buf = AlignedBuf::zeroed(layout.total_size);
    {
        let mut writer = ByteWriter::new(&mut buf);

        writer.write_pod(&RawBufferHeader { size: layout.total_size as u32, hash: 0 });

        writer.write_pod(&TracksHeader {
            tag: COMPRESSED_TRACKS_TAG,
            version: COMPRESSED_TRACKS_VERSION_LATEST,
            flags,
            num_tracks: lossy.num_bones,
            num_samples: lossy.num_samples,
            sample_rate: lossy.sample_rate,
            rotation_format: settings.rotation_format.to_u8(),
            translation_format: settings.translation_format.to_u8(),
            scale_format: settings.scale_format.to_u8(),
            range_reduction: settings.range_reduction.bits(),
        });

        writer.expect_position(TRANSFORM_HEADER_OFFSET);
        writer.write_pod(&layout.transform_header);

        let anchored = |offset: u32| TRANSFORM_HEADER_OFFSET + offset as usize;

        if layout.transform_header.segment_start_indices_offset != 0 {
            writer.align(4);
            writer.expect_position(anchored(layout.transform_header.segment_start_indices_offset));
            for segment in &lossy.segments {
                writer.write_u32(segment.clip_sample_offset);
            }
            writer.write_u32(lossy.num_samples);
        }

        writer.align(4);
        writer.expect_position(anchored(layout.transform_header.segment_headers_offset));
        for segment_header in &layout.segment_headers {
            writer.write_pod(segment_header);
        }

        // Default and constant sub-track bitsets, one bit per sub-track in bone order.
        let num_words = BitsetDescription::with_num_bits(layout.num_sub_tracks).num_words() as usize;
        let mut default_words = vec![0u32; num_words];
        let mut constant_words = vec![0u32; num_words];
        let stride = if lossy.has_scale { 3u32 } else { 2 };

        for (bone_index, bone_stream) in lossy.segments[0].bone_streams.iter().enumerate() {
            let base = bone_index as u32 * stride;
            if bone_stream.is_rotation_default {
                bitset_set(&mut default_words, base, true);
            }
            if bone_stream.is_rotation_constant {
                bitset_set(&mut constant_words, base, true);
            }
            if bone_stream.is_translation_default {
                bitset_set(&mut default_words, base + 1, true);
            }
            if bone_stream.is_translation_constant {
                bitset_set(&mut constant_words, base + 1, true);
            }
            if lossy.has_scale {
                if bone_stream.is_scale_default {
                    bitset_set(&mut default_words, base + 2, true);
                }
                if bone_stream.is_scale_constant {
                    bitset_set(&mut constant_words, base + 2, true);
                }
            }
        }

        writer.align(4);
        writer.expect_position(anchored(layout.transform_header.default_bitset_offset));
        for word in &default_words {
            writer.write_u32(*word);
        }
        writer.expect_position(anchored(layout.transform_header.constant_bitset_offset));
        for word in &constant_words {
            writer.write_u32(*word);
        }

        if layout.transform_header.output_indices_offset != 0 {
            writer.align(4);
            writer.expect_position(anchored(layout.transform_header.output_indices_offset));
            for bone in track_list.skeleton().bones() {
                writer.write_u32(bone.output_index);
            }
        }

        // Constant track values at full precision.
        writer.align(4);
        writer.expect_position(anchored(layout.transform_header.constant_track_data_offset));
        for bone_stream in &lossy.segments[0].bone_streams {
            if bone_stream.is_rotation_constant && !bone_stream.is_rotation_default {
                let value = bone_stream.rotations[0];
                writer.write_f32(value.x);
                writer.write_f32(value.y);
                writer.write_f32(value.z);
                if settings.rotation_format == RotationFormat::QuatFull {
                    writer.write_f32(value.w);
                }
            }
            if bone_stream.is_translation_constant && !bone_stream.is_translation_default {
                let value = bone_stream.translations[0];
                writer.write_f32(value.x);
                writer.write_f32(value.y);
                writer.write_f32(value.z);
            }
            if lossy.has_scale && bone_stream.is_scale_constant && !bone_stream.is_scale_default {
                let value = bone_stream.scales[0];
                writer.write_f32(value.x);
                writer.write_f32(value.y);
                writer.write_f32(value.z);
            }
        }

        // Clip range data for the range-reduced families.
        writer.align(4);
        writer.expect_position(anchored(layout.transform_header.clip_range_data_offset));
        for sub_track in &layout.animated {
            if !channel_range_reduced(sub_track.channel, settings.range_reduction) {
                continue;
            }

            let ranges = &lossy.ranges[sub_track.bone_index as usize];
            let range = match sub_track.channel {
                SubTrackChannel::Rotation => &ranges.rotation,
                SubTrackChannel::Translation => &ranges.translation,
                SubTrackChannel::Scale => &ranges.scale,
            };
            let num_components = channel_num_components(sub_track.channel, settings.rotation_format);

            for component in 0..num_components as usize {
                writer.write_f32(range.min[component]);
            }
            for component in 0..num_components as usize {
                writer.write_f32(range.extent[component]);
            }
        }

        writer.expect_position(anchored(layout.transform_header.animated_group_types_offset));
        for sub_track in &layout.animated {
            writer.write_u8(sub_track.channel.to_u8());
        }

        // Per-segment data.
        let num_segments = lossy.segments.len();
        for (segment, segment_header) in lossy.segments.iter().zip(layout.segment_headers.iter()) {
            writer.expect_position(anchored(segment_header.segment_data_offset));

            // Chosen bit rate per animated sub-track.
            for sub_track in &layout.animated {
                let bit_rate = if channel_is_variable(sub_track.channel, settings) {
                    sub_track_bit_rate(segment, sub_track)
                }
                else {
                    INVALID_BIT_RATE
                };
                writer.write_u8(bit_rate);
            }

            if num_segments > 1 {
                writer.align(2);
                write_segment_range_data(&mut writer, lossy, raw, segment, &layout.animated, settings);
            }

            writer.align(4);
            let animated_bytes = write_animated_data(segment, raw, &layout.animated, settings);
            debug_assert_eq!(
                animated_bytes.len(),
                ((segment.num_samples as u64 * segment_header.animated_pose_bit_size as u64 + 7) / 8)
                    as usize
            );
            writer.write_bytes(&animated_bytes);
        }

        writer.skip_to(writer.position + SIMD_PADDING);

        if let Some(contributing_errors) = contributing_errors {
            writer.align(4);
            writer.expect_position(anchored(layout.metadata_offset));
            for segment_errors in contributing_errors {
                for &(frame_index, error) in segment_errors {
                    writer.write_u32(frame_index);
                    writer.write_f32(error);
                }
            }
            writer.write_u32(layout.metadata_offset);
        }

        writer.expect_position(layout.total_size);
    }

    // Patch the content hash over everything after the raw buffer header.
    let content_hash = hash32(&buf[RAW_BUFFER_HEADER_SIZE..]);
    buf[4..8].copy_from_slice(&content_hash.to_le_bytes());

    debug!(
        "wrote compressed tracks: {} bytes, {} segments, {} animated sub tracks",
        layout.total_size,
        lossy.segments.len(),
        layout.animated.len()
    );

    CompressedTracksBuf::new_unchecked(buf)
}

/// Writes one segment's range data: per animated sub-track either the 8-bit (min, extent) pair
/// or, for constant-bit-rate sub-tracks, the single 48-bit sample in clip-range space.
fn write_segment_range_data(
    writer: &mut ByteWriter<'_>,
    lossy: &ClipContext,
    raw: &ClipContext,
    segment: &SegmentContext,
    animated: &[AnimatedSubTrack],
    settings: &CompressionSettings,
) {
    for sub_track in animated {
        if !channel_range_reduced(sub_track.channel, settings.range_reduction) {
            continue;
        }

        let bone_index = sub_track.bone_index as usize;
        let num_components = channel_num_components(sub_track.channel, settings.rotation_format);
        let is_variable = channel_is_variable(sub_track.channel, settings);
        let bit_rate =
            if is_variable { sub_track_bit_rate(segment, sub_track) } else { INVALID_BIT_RATE };

        if is_variable && is_constant_bit_rate(bit_rate) {
            // The slot holds the constant sample at 16 bits per component instead of a range.
            let raw_stream = &raw.segments[0].bone_streams[bone_index];
            let raw_sample_index = segment.clip_sample_offset as usize;

            let (raw_value, clip_range) = match sub_track.channel {
                SubTrackChannel::Rotation => {
                    let rotation = vec4_to_quat(raw_stream.rotations[raw_sample_index]);
                    let converted = quat_ensure_positive_w(rotation);
                    (
                        Vec4::new(converted.x, converted.y, converted.z, converted.w),
                        &lossy.ranges[bone_index].rotation,
                    )
                }
                SubTrackChannel::Translation => {
                    (raw_stream.translations[raw_sample_index], &lossy.ranges[bone_index].translation)
                }
                SubTrackChannel::Scale => {
                    (raw_stream.scales[raw_sample_index], &lossy.ranges[bone_index].scale)
                }
            };

            let normalized = normalize_vec4(raw_value, clip_range);
            for component in 0..3 {
                let packed =
                    pack_scalar_unsigned(normalized[component], CONSTANT_BIT_RATE_NUM_BITS) as u16;
                writer.write_bytes(&packed.to_le_bytes());
            }
        }
        else {
            let ranges = &segment.ranges[bone_index];
            let range = match sub_track.channel {
                SubTrackChannel::Rotation => &ranges.rotation,
                SubTrackChannel::Translation => &ranges.translation,
                SubTrackChannel::Scale => &ranges.scale,
            };

            for component in 0..num_components as usize {
                writer.write_u8(pack_scalar_unsigned(range.min[component], 8) as u8);
            }
            for component in 0..num_components as usize {
                writer.write_u8(pack_scalar_unsigned(range.extent[component], 8) as u8);
            }
        }
    }
}

/// Bit-packs one segment's animated frames, all sub-tracks of a frame back to back.
fn write_animated_data(
    segment: &SegmentContext,
    raw: &ClipContext,
    animated: &[AnimatedSubTrack],
    settings: &CompressionSettings,
) -> Vec<u8> {
    let mut bits = BitWriterLtr::new();

    for sample_index in 0..segment.num_samples {
        for sub_track in animated {
            let bone_index = sub_track.bone_index as usize;
            let bone_stream = &segment.bone_streams[bone_index];
            let stream = sub_track_stream(bone_stream, sub_track.channel);
            let is_variable = channel_is_variable(sub_track.channel, settings);

            if is_variable {
                let bit_rate = sub_track_bit_rate(segment, sub_track);
                debug_assert!(bit_rate != INVALID_BIT_RATE);

                if is_constant_bit_rate(bit_rate) {
                    // The single sample lives in the segment range slot.
                    continue;
                }

                if is_raw_bit_rate(bit_rate) {
                    // Raw components skip range reduction entirely.
                    let raw_stream = &raw.segments[0].bone_streams[bone_index];
                    let raw_sample_index = (segment.clip_sample_offset + sample_index) as usize;
                    let value = match sub_track.channel {
                        SubTrackChannel::Rotation => {
                            let rotation = vec4_to_quat(raw_stream.rotations[raw_sample_index]);
                            let converted = quat_ensure_positive_w(rotation);
                            Vec4::new(converted.x, converted.y, converted.z, converted.w)
                        }
                        SubTrackChannel::Translation => raw_stream.translations[raw_sample_index],
                        SubTrackChannel::Scale => raw_stream.scales[raw_sample_index],
                    };

                    for component in 0..3 {
                        bits.write_f32(value[component]);
                    }
                }
                else {
                    let num_bits = num_bits_at_bit_rate(bit_rate);
                    let value = stream[sample_index as usize];
                    for component in 0..3 {
                        bits.write_bits(
                            u64::from(pack_scalar_unsigned(value[component], num_bits)),
                            num_bits,
                        );
                    }
                }
            }
            else {
                // Full-precision formats store their (possibly range-reduced) components raw.
                let value = stream[sample_index as usize];
                let num_components =
                    channel_num_components(sub_track.channel, settings.rotation_format) as usize;
                for component in 0..num_components {
                    bits.write_f32(value[component]);
                }
            }
        }
    }

    bits.into_bytes()
}
