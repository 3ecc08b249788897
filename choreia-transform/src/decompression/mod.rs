// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `decompression` module samples compressed transform tracks at arbitrary times.
//!
//! A context binds a compressed buffer (and optionally a database context), seeks to a sample
//! time resolving the two surrounding keyframes, then decompresses poses or single tracks. The
//! two keyframes may live in different segments and, when a database is bound, in different
//! storage tiers; each carries its own cursors. Sub-tracks are unpacked in storage order with
//! a single running bit offset per keyframe, so one full-pose decompression touches every byte
//! exactly once.

use choreia_core::errors::{not_bound_error, Result};
use choreia_core::io::read_bits_ltr;
use choreia_core::math::{quat_from_positive_w, quat_nlerp, unpack_scalar_unsigned, vec4_to_quat};
use choreia_core::units::find_interpolation_keys;

use crate::bit_rate::{is_constant_bit_rate, is_raw_bit_rate, num_bits_at_bit_rate, INVALID_BIT_RATE};
use crate::container::{read_f32, CompressedTracks, RUNTIME_SEGMENT_HEADER_SIZE};
use crate::database::DatabaseContext;
use crate::settings::{RangeReductionFlags, RotationFormat, VectorFormat};

use choreia_core::bitset::bitset_test;

use glam::{Quat, Vec3, Vec4};

pub use choreia_core::units::SampleRoundingPolicy;

/// Receives the decompressed pose, one channel write per sub-track in track storage order.
///
/// Writers receive the track's output index. Tracks stripped from the output are never
/// written. The `skip_*` predicates let a writer opt out of channels it does not care about;
/// the decompressor still advances past the data.
pub trait PoseWriter {
    fn write_rotation(&mut self, track_index: u32, rotation: Quat);
    fn write_translation(&mut self, track_index: u32, translation: Vec3);
    fn write_scale(&mut self, track_index: u32, scale: Vec3);

    fn skip_track_rotation(&self, _track_index: u32) -> bool {
        false
    }

    fn skip_track_translation(&self, _track_index: u32) -> bool {
        false
    }

    fn skip_track_scale(&self, _track_index: u32) -> bool {
        false
    }
}

/// Where one keyframe's animated bits live.
#[derive(Copy, Clone, Debug)]
enum FrameSource {
    /// Inside the compressed tracks buffer.
    Inline,
    /// Inside a streamed-in bulk data region.
    Bulk { tier_index: usize },
}

/// One resolved keyframe: its segment's data cursors and the frame's bit base.
#[derive(Copy, Clone, Debug)]
struct KeyFrameCursor {
    /// Buffer position of the segment's per-track bit rate bytes.
    format_base: usize,
    /// Buffer position of the segment's range data; usize::MAX when the clip has none.
    range_base: usize,
    /// Bit offset of the keyframe's first bit within its source.
    frame_base_bit: u64,
    source: FrameSource,
}

#[derive(Copy, Clone, Debug)]
struct SeekState {
    alpha: f32,
    keys: [KeyFrameCursor; 2],
}

/// Decompresses poses from one compressed tracks buffer.
///
/// The context is cheap to construct and borrows the buffer; it must outlive any sampling
/// call. Distinct contexts may sample the same buffer concurrently.
pub struct DecompressionContext<'a> {
    tracks: CompressedTracks<'a>,
    database: Option<&'a DatabaseContext<'a>>,

    default_bitset: Vec<u32>,
    constant_bitset: Vec<u32>,

    rotation_format: RotationFormat,
    translation_format: VectorFormat,
    scale_format: VectorFormat,
    range_reduction: RangeReductionFlags,
    has_scale: bool,
    has_segment_range_data: bool,

    seek_state: Option<SeekState>,
}

impl<'a> DecompressionContext<'a> {
    /// Binds a compressed tracks buffer.
    pub fn new(tracks: CompressedTracks<'a>) -> Result<Self> {
        if tracks.is_bound_to_database() {
            // The clip's animated data is split with a database; sampling needs it.
            return not_bound_error();
        }
        Self::new_impl(tracks, None)
    }

    /// Binds a compressed tracks buffer together with the database holding its streamed
    /// keyframes.
    pub fn with_database(
        tracks: CompressedTracks<'a>,
        database: &'a DatabaseContext<'a>,
    ) -> Result<Self> {
        if !tracks.is_bound_to_database() || !database.contains(&tracks) {
            return not_bound_error();
        }
        Self::new_impl(tracks, Some(database))
    }

    fn new_impl(tracks: CompressedTracks<'a>, database: Option<&'a DatabaseContext<'a>>) -> Result<Self> {
        let context = DecompressionContext {
            default_bitset: tracks.default_bitset(),
            constant_bitset: tracks.constant_bitset(),
            rotation_format: tracks.rotation_format(),
            translation_format: tracks.translation_format(),
            scale_format: tracks.scale_format(),
            range_reduction: RangeReductionFlags::from_bits_truncate(tracks.header().range_reduction),
            has_scale: tracks.has_scale(),
            has_segment_range_data: tracks.num_segments() > 1,
            tracks,
            database,
            seek_state: None,
        };
        Ok(context)
    }

    #[inline]
    pub fn tracks(&self) -> &CompressedTracks<'a> {
        &self.tracks
    }

    /// The number of animated sub-tracks preceding the start of a segment's range data, and the
    /// byte size of that range data.
    fn segment_layout_sizes(&self) -> (usize, usize) {
        let num_animated = self.num_animated_sub_tracks();

        let mut range_data_size = 0usize;
        for sub_track_index in 0..self.tracks.num_sub_tracks() {
            if !self.is_sub_track_animated(sub_track_index) {
                continue;
            }
            let channel = sub_track_index % self.tracks.num_sub_tracks_per_track();
            if self.channel_range_reduced(channel) {
                range_data_size += 2 * self.channel_num_components(channel) as usize;
            }
        }

        (num_animated, range_data_size)
    }

    fn num_animated_sub_tracks(&self) -> usize {
        let num_sub_tracks = self.tracks.num_sub_tracks();
        (0..num_sub_tracks).filter(|&sub_track| self.is_sub_track_animated(sub_track)).count()
    }

    #[inline]
    fn is_sub_track_animated(&self, sub_track_index: u32) -> bool {
        !bitset_test(&self.constant_bitset, sub_track_index)
    }

    #[inline]
    fn channel_num_components(&self, channel: u32) -> u32 {
        if channel == 0 {
            self.rotation_format.num_components()
        }
        else {
            3
        }
    }

    #[inline]
    fn channel_range_reduced(&self, channel: u32) -> bool {
        match channel {
            0 => self.range_reduction.contains(RangeReductionFlags::ROTATIONS),
            1 => self.range_reduction.contains(RangeReductionFlags::TRANSLATIONS),
            _ => self.range_reduction.contains(RangeReductionFlags::SCALES),
        }
    }

    #[inline]
    fn channel_is_variable(&self, channel: u32) -> bool {
        match channel {
            0 => self.rotation_format.is_variable(),
            1 => self.translation_format.is_variable(),
            _ => self.scale_format.is_variable(),
        }
    }

    /// The frame presence masks of a segment: inline plus one per streamable tier, with the
    /// bulk byte offset of each tier's frames.
    fn segment_presence(&self, segment_index: u32) -> (u32, [(u32, u32); 2]) {
        let inline_mask = self.tracks.segment_header(segment_index).sample_indices;

        let mut tiers = [(0u32, 0u32); 2];
        if let (Some(database), Some(db_header)) = (self.database, self.tracks.database_header()) {
            let segment_header_offset =
                db_header.segment_headers_offset + segment_index * RUNTIME_SEGMENT_HEADER_SIZE;
            tiers = database.runtime_segment_tiers(segment_header_offset);
        }

        (inline_mask, tiers)
    }

    /// Resolves a clip sample index onto the nearest stored frame at or towards the given
    /// direction, returning the cursor and the resolved clip sample index.
    fn resolve_key(&self, clip_sample_index: u32, snap_up: bool) -> (KeyFrameCursor, u32) {
        let segment_index = self.tracks.segment_containing(clip_sample_index);
        let segment_start = self.tracks.segment_start_index(segment_index);
        let local_frame = clip_sample_index - segment_start;

        let (inline_mask, tiers) = self.segment_presence(segment_index);
        let present_mask = inline_mask | tiers[0].1 | tiers[1].1;
        debug_assert!(present_mask != 0, "a segment always has its anchor frames");

        // Snap to the nearest present frame; anchors are always inline so the scan terminates.
        let mut frame = local_frame;
        while present_mask & (1 << frame) == 0 {
            if snap_up {
                frame += 1;
            }
            else {
                frame -= 1;
            }
        }

        // Locate the frame's store and its rank within that store.
        let frame_bit = 1u32 << frame;
        let below = frame_bit - 1;

        let header = self.tracks.segment_header(segment_index);
        let pose_bit_size = u64::from(header.animated_pose_bit_size);

        let (source, store_mask, store_base_bit) = if inline_mask & frame_bit != 0 {
            let animated_base = self.segment_animated_data_base(segment_index);
            (FrameSource::Inline, inline_mask, animated_base as u64 * 8)
        }
        else if tiers[0].1 & frame_bit != 0 {
            (FrameSource::Bulk { tier_index: 0 }, tiers[0].1, u64::from(tiers[0].0) * 8)
        }
        else {
            (FrameSource::Bulk { tier_index: 1 }, tiers[1].1, u64::from(tiers[1].0) * 8)
        };

        let rank = (store_mask & below).count_ones();
        let frame_base_bit = store_base_bit + u64::from(rank) * pose_bit_size;

        let num_animated = self.num_animated_sub_tracks();
        let format_base = self.tracks.anchored(header.segment_data_offset);

        let range_base = if self.has_segment_range_data {
            crate::container::align_to(format_base + num_animated, 2)
        }
        else {
            usize::MAX
        };

        let cursor = KeyFrameCursor {
            format_base,
            range_base,
            frame_base_bit,
            source,
        };

        (cursor, segment_start + frame)
    }

    /// Buffer position of a segment's inline animated stream.
    fn segment_animated_data_base(&self, segment_index: u32) -> usize {
        let header = self.tracks.segment_header(segment_index);
        let (num_animated, range_data_size) = self.segment_layout_sizes();

        let mut position = self.tracks.anchored(header.segment_data_offset) + num_animated;
        if self.has_segment_range_data {
            position = crate::container::align_to(position, 2) + range_data_size;
        }
        crate::container::align_to(position, 4)
    }

    /// Seeks to a sample time, resolving the surrounding keyframes with the given rounding.
    /// Sample times outside the clip clamp to its boundary samples.
    pub fn seek(&mut self, sample_time: f32, rounding: SampleRoundingPolicy) {
        let num_samples = self.tracks.num_samples();
        if num_samples == 0 {
            return;
        }

        let keys = find_interpolation_keys(
            num_samples,
            self.tracks.sample_rate(),
            sample_time,
            rounding,
        );

        let (key0, resolved0) = self.resolve_key(keys.key0, false);
        let (key1, resolved1) = self.resolve_key(keys.key1.max(resolved0), true);

        // When database tiers are missing frames the keyframes move apart; remap the blend
        // factor onto the resolved pair.
        let alpha = if resolved1 > resolved0 {
            let position = keys.key0 as f32 + keys.alpha;
            ((position - resolved0 as f32) / (resolved1 - resolved0) as f32).clamp(0.0, 1.0)
        }
        else {
            0.0
        };

        self.seek_state = Some(SeekState { alpha, keys: [key0, key1] });
    }

    /// Decompresses the pose at the seeked time, writing every non-stripped track.
    pub fn decompress_pose(&mut self, writer: &mut impl PoseWriter) {
        debug_assert!(self.seek_state.is_some(), "decompress_pose requires a prior seek");
        let Some(seek_state) = self.seek_state else { return };

        let mut cursors = PoseCursors::new(self, &seek_state);

        for track_index in 0..self.tracks.num_tracks() {
            cursors.decode_track(self, &seek_state, track_index, writer);
        }
    }

    /// Decompresses a single track at the seeked time, skipping over the preceding tracks.
    pub fn decompress_track(&mut self, track_index: u32) -> Option<(Quat, Vec3, Vec3)> {
        debug_assert!(self.seek_state.is_some(), "decompress_track requires a prior seek");
        let seek_state = self.seek_state?;

        if track_index >= self.tracks.num_tracks() {
            return None;
        }

        let mut cursors = PoseCursors::new(self, &seek_state);

        for _ in 0..track_index {
            cursors.skip_track(self, &seek_state);
        }

        Some(cursors.decode_track_values(self, &seek_state))
    }

    /// Forgets the current seek state.
    pub fn reset_seek(&mut self) {
        self.seek_state = None;
    }
}

/// The running cursors of one pose decompression pass.
struct PoseCursors {
    constant_pos: usize,
    clip_range_pos: usize,
    /// Per keyframe: byte cursor into the segment's per-track bit rates.
    format_pos: [usize; 2],
    /// Per keyframe: byte cursor into the segment's range data.
    range_pos: [usize; 2],
    /// Per keyframe: bit cursor within the keyframe's animated bits.
    bit_offset: [u64; 2],
    sub_track_index: u32,
}

impl PoseCursors {
    fn new(context: &DecompressionContext<'_>, seek_state: &SeekState) -> Self {
        let transform_header = context.tracks.transform_header();

        PoseCursors {
            constant_pos: context.tracks.anchored(transform_header.constant_track_data_offset),
            clip_range_pos: context.tracks.anchored(transform_header.clip_range_data_offset),
            format_pos: [seek_state.keys[0].format_base, seek_state.keys[1].format_base],
            range_pos: [seek_state.keys[0].range_base, seek_state.keys[1].range_base],
            bit_offset: [seek_state.keys[0].frame_base_bit, seek_state.keys[1].frame_base_bit],
            sub_track_index: 0,
        }
    }

    /// The animated bit source of one keyframe.
    fn key_data<'b>(
        context: &DecompressionContext<'b>,
        seek_state: &SeekState,
        key_index: usize,
    ) -> &'b [u8] {
        match seek_state.keys[key_index].source {
            FrameSource::Inline => context.tracks.data(),
            FrameSource::Bulk { tier_index } => context
                .database
                .expect("bulk frames require a database")
                .bulk_slice(tier_index)
                .expect("tier was published, its bulk data must be resident"),
        }
    }

    fn decode_track(
        &mut self,
        context: &DecompressionContext<'_>,
        seek_state: &SeekState,
        track_index: u32,
        writer: &mut impl PoseWriter,
    ) {
        let output_index = context.tracks.output_index(track_index);
        if output_index == u32::MAX {
            // Stripped from the output; advance past its data silently.
            self.advance_track(context, seek_state, false);
            return;
        }

        let (rotation, translation, scale) = self.advance_track(context, seek_state, true);

        if !writer.skip_track_rotation(output_index) {
            writer.write_rotation(output_index, rotation.unwrap());
        }
        if !writer.skip_track_translation(output_index) {
            writer.write_translation(output_index, translation.unwrap());
        }
        if !writer.skip_track_scale(output_index) {
            writer.write_scale(output_index, scale.unwrap());
        }
    }

    fn skip_track(&mut self, context: &DecompressionContext<'_>, seek_state: &SeekState) {
        self.advance_track(context, seek_state, false);
    }

    fn decode_track_values(
        &mut self,
        context: &DecompressionContext<'_>,
        seek_state: &SeekState,
    ) -> (Quat, Vec3, Vec3) {
        let (rotation, translation, scale) = self.advance_track(context, seek_state, true);
        (rotation.unwrap(), translation.unwrap(), scale.unwrap())
    }

    /// Advances every cursor past one track, decoding its channels when requested.
    fn advance_track(
        &mut self,
        context: &DecompressionContext<'_>,
        seek_state: &SeekState,
        decode: bool,
    ) -> (Option<Quat>, Option<Vec3>, Option<Vec3>) {
        let rotation = self.advance_rotation(context, seek_state, decode);
        let translation = self.advance_vector(context, seek_state, 1, decode);

        let scale = if context.has_scale {
            self.advance_vector(context, seek_state, 2, decode)
        }
        else if decode {
            Some(Vec3::ONE)
        }
        else {
            None
        };

        (rotation, translation, scale)
    }

    fn advance_rotation(
        &mut self,
        context: &DecompressionContext<'_>,
        seek_state: &SeekState,
        decode: bool,
    ) -> Option<Quat> {
        let sub_track_index = self.sub_track_index;
        self.sub_track_index += 1;

        if bitset_test(&context.default_bitset, sub_track_index) {
            return if decode { Some(Quat::IDENTITY) } else { None };
        }

        let num_components = context.rotation_format.num_components() as usize;

        if bitset_test(&context.constant_bitset, sub_track_index) {
            let value = if decode {
                let data = context.tracks.data();
                let mut components = Vec4::ZERO;
                for component in 0..num_components {
                    components[component] = read_f32(data, self.constant_pos + component * 4);
                }
                Some(rotation_from_components(components, context.rotation_format))
            }
            else {
                None
            };

            self.constant_pos += num_components * 4;
            return value;
        }

        // Animated: unpack both keyframes and blend.
        let mut keys = [Vec4::ZERO; 2];
        let range_reduced = context.channel_range_reduced(0);

        for key_index in 0..2 {
            let data = Self::key_data(context, seek_state, key_index);
            let (value, consumed_bits, skip_segment_range, skip_clip_range) =
                self.unpack_components(context, data, key_index, 0, decode);

            if decode {
                let mut value = value;
                if range_reduced {
                    if context.has_segment_range_data && !skip_segment_range {
                        value = self.apply_segment_range(context, key_index, value, num_components);
                    }
                    if !skip_clip_range {
                        value = apply_clip_range(
                            context.tracks.data(),
                            self.clip_range_pos,
                            value,
                            num_components,
                        );
                    }
                }
                keys[key_index] = value;
            }

            self.bit_offset[key_index] += u64::from(consumed_bits);
            self.format_pos[key_index] += 1;
            if range_reduced && context.has_segment_range_data {
                self.range_pos[key_index] += 2 * num_components;
            }
        }

        if range_reduced {
            self.clip_range_pos += 2 * num_components * 4;
        }

        if !decode {
            return None;
        }

        let rotation0 = rotation_from_components(keys[0], context.rotation_format);
        let rotation1 = rotation_from_components(keys[1], context.rotation_format);
        Some(quat_nlerp(rotation0, rotation1, seek_state.alpha))
    }

    fn advance_vector(
        &mut self,
        context: &DecompressionContext<'_>,
        seek_state: &SeekState,
        channel: u32,
        decode: bool,
    ) -> Option<Vec3> {
        let sub_track_index = self.sub_track_index;
        self.sub_track_index += 1;

        if bitset_test(&context.default_bitset, sub_track_index) {
            let default_value = if channel == 1 { Vec3::ZERO } else { Vec3::ONE };
            return if decode { Some(default_value) } else { None };
        }

        if bitset_test(&context.constant_bitset, sub_track_index) {
            let value = if decode {
                let data = context.tracks.data();
                Some(Vec3::new(
                    read_f32(data, self.constant_pos),
                    read_f32(data, self.constant_pos + 4),
                    read_f32(data, self.constant_pos + 8),
                ))
            }
            else {
                None
            };

            self.constant_pos += 3 * 4;
            return value;
        }

        let mut keys = [Vec4::ZERO; 2];
        let range_reduced = context.channel_range_reduced(channel);

        for key_index in 0..2 {
            let data = Self::key_data(context, seek_state, key_index);
            let (value, consumed_bits, skip_segment_range, skip_clip_range) =
                self.unpack_components(context, data, key_index, channel, decode);

            if decode {
                let mut value = value;
                if range_reduced {
                    if context.has_segment_range_data && !skip_segment_range {
                        value = self.apply_segment_range(context, key_index, value, 3);
                    }
                    if !skip_clip_range {
                        value =
                            apply_clip_range(context.tracks.data(), self.clip_range_pos, value, 3);
                    }
                }
                keys[key_index] = value;
            }

            self.bit_offset[key_index] += u64::from(consumed_bits);
            self.format_pos[key_index] += 1;
            if range_reduced && context.has_segment_range_data {
                self.range_pos[key_index] += 2 * 3;
            }
        }

        if range_reduced {
            self.clip_range_pos += 2 * 3 * 4;
        }

        if !decode {
            return None;
        }

        let blended = keys[0].truncate().lerp(keys[1].truncate(), seek_state.alpha);
        Some(blended)
    }

    /// Unpacks one keyframe's components of an animated sub-track, returning the raw value,
    /// the bits consumed from the animated stream, and which range reductions to skip.
    fn unpack_components(
        &mut self,
        context: &DecompressionContext<'_>,
        data: &[u8],
        key_index: usize,
        channel: u32,
        decode: bool,
    ) -> (Vec4, u32, bool, bool) {
        if context.channel_is_variable(channel) {
            let bit_rate = context.tracks.data()[self.format_pos[key_index]];
            debug_assert!(bit_rate != INVALID_BIT_RATE);

            if is_constant_bit_rate(bit_rate) {
                // The single sample sits in this sub-track's segment range slot at 16 bits
                // per component. Only the clip range applies.
                let mut value = Vec4::ZERO;
                if decode {
                    let tracks_data = context.tracks.data();
                    let base = self.range_pos[key_index];
                    for component in 0..3 {
                        let packed = u16::from_le_bytes(
                            tracks_data[base + component * 2..base + component * 2 + 2]
                                .try_into()
                                .unwrap(),
                        );
                        value[component] = unpack_scalar_unsigned(u32::from(packed), 16);
                    }
                }
                (value, 0, true, false)
            }
            else if is_raw_bit_rate(bit_rate) {
                let mut value = Vec4::ZERO;
                if decode {
                    for component in 0..3 {
                        let bits = read_bits_ltr(
                            data,
                            self.bit_offset[key_index] + component as u64 * 32,
                            32,
                        ) as u32;
                        value[component] = f32::from_bits(bits);
                    }
                }
                (value, 3 * 32, true, true)
            }
            else {
                let num_bits = num_bits_at_bit_rate(bit_rate);
                let mut value = Vec4::ZERO;
                if decode {
                    for component in 0..3 {
                        let packed = read_bits_ltr(
                            data,
                            self.bit_offset[key_index] + component as u64 * u64::from(num_bits),
                            num_bits,
                        ) as u32;
                        value[component] = unpack_scalar_unsigned(packed, num_bits);
                    }
                }
                (value, 3 * num_bits, false, false)
            }
        }
        else {
            // Full-precision formats store raw (possibly range reduced) float components.
            let num_components = if channel == 0 {
                context.rotation_format.num_components() as usize
            }
            else {
                3
            };

            let mut value = Vec4::ZERO;
            if decode {
                for component in 0..num_components {
                    let bits = read_bits_ltr(
                        data,
                        self.bit_offset[key_index] + component as u64 * 32,
                        32,
                    ) as u32;
                    value[component] = f32::from_bits(bits);
                }
            }
            (value, num_components as u32 * 32, false, false)
        }
    }

    /// Expands a value out of its 8-bit segment range.
    fn apply_segment_range(
        &self,
        context: &DecompressionContext<'_>,
        key_index: usize,
        value: Vec4,
        num_components: usize,
    ) -> Vec4 {
        let data = context.tracks.data();
        let base = self.range_pos[key_index];

        let mut result = value;
        for component in 0..num_components {
            let range_min = unpack_scalar_unsigned(u32::from(data[base + component]), 8);
            let range_extent =
                unpack_scalar_unsigned(u32::from(data[base + num_components + component]), 8);
            result[component] = value[component] * range_extent + range_min;
        }
        result
    }
}

/// Expands a value out of its full-precision clip range.
fn apply_clip_range(data: &[u8], clip_range_pos: usize, value: Vec4, num_components: usize) -> Vec4 {
    let mut result = value;
    for component in 0..num_components {
        let range_min = read_f32(data, clip_range_pos + component * 4);
        let range_extent = read_f32(data, clip_range_pos + (num_components + component) * 4);
        result[component] = value[component] * range_extent + range_min;
    }
    result
}

fn rotation_from_components(value: Vec4, rotation_format: RotationFormat) -> Quat {
    match rotation_format {
        RotationFormat::QuatFull => vec4_to_quat(value),
        _ => quat_from_positive_w(value),
    }
}
