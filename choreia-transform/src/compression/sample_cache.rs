// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `sample_cache` module memoises quantized-then-dequantized samples.
//!
//! The bit-rate search evaluates the same `(bone, channel, sample, bit rate)` tuple many times:
//! measuring one bone's object-space error decodes its whole ancestor chain, and neighboring
//! permutations mostly re-decode unchanged bit rates. Each channel keeps one slot for its
//! constant/default/full-precision value and four slots for variable bit rates, replaced least
//! recently used via a monotonically increasing generation counter.

use choreia_core::bitset::{bitset_reset, bitset_set, bitset_test, BitsetDescription};
use choreia_core::math::{
    decay_vec3_unsigned, quat_ensure_positive_w, quat_from_positive_w, vec4_to_quat,
};

use crate::bit_rate::{
    is_constant_bit_rate, is_raw_bit_rate, num_bits_at_bit_rate, CONSTANT_BIT_RATE_NUM_BITS,
    INVALID_BIT_RATE,
};
use crate::compression::clip_context::ClipContext;
use crate::compression::range::{expand_vec4, normalize_vec4};
use crate::settings::{CompressionSettings, RotationFormat};

use glam::{Quat, Vec4};

/// The channels a transform track decomposes into.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Channel {
    Rotation,
    Translation,
    Scale,
}

/// Everything a decode needs besides the cache itself.
pub(crate) struct DecodeArgs<'a> {
    pub lossy: &'a ClipContext,
    pub raw: &'a ClipContext,
    pub segment_index: usize,
    pub settings: &'a CompressionSettings,
}

const NUM_VARIABLE_SLOTS: usize = 4;

#[derive(Clone, Debug, Default)]
struct CacheSlot {
    bit_rate: u8,
    /// 0 marks a slot that was never reserved.
    generation: u32,
    valid: Vec<u32>,
    values: Vec<Vec4>,
}

#[derive(Clone, Debug, Default)]
struct ChannelCache {
    /// Shared slot for constant, default, and full-precision decodes.
    invalid_slot: CacheSlot,
    variable_slots: [CacheSlot; NUM_VARIABLE_SLOTS],
}

/// Memoised decode results for one segment.
pub(crate) struct SampleCache {
    channels: Vec<ChannelCache>,
    num_channels_per_bone: usize,
    num_samples: u32,
    bitset_desc: BitsetDescription,
    generation: u32,
}

impl SampleCache {
    pub fn new(num_bones: u32, has_scale: bool, num_samples: u32) -> Self {
        let num_channels_per_bone = if has_scale { 3 } else { 2 };

        let mut cache = SampleCache {
            channels: vec![ChannelCache::default(); num_bones as usize * num_channels_per_bone],
            num_channels_per_bone,
            num_samples: 0,
            bitset_desc: BitsetDescription::with_num_bits(num_samples),
            generation: 1,
        };
        cache.reset(num_samples);
        cache
    }

    /// Discards every cached sample. Called when the segment under consideration changes.
    pub fn reset(&mut self, num_samples: u32) {
        self.num_samples = num_samples;
        self.bitset_desc = BitsetDescription::with_num_bits(num_samples);

        let num_words = self.bitset_desc.num_words() as usize;
        for channel in &mut self.channels {
            for slot in std::iter::once(&mut channel.invalid_slot)
                .chain(channel.variable_slots.iter_mut())
            {
                slot.bit_rate = INVALID_BIT_RATE;
                slot.generation = 0;
                slot.valid = vec![0u32; num_words];
                slot.values = vec![Vec4::ZERO; num_samples as usize];
            }
        }
    }

    fn channel_index(&self, bone_index: u32, channel: Channel) -> usize {
        let channel_offset = match channel {
            Channel::Rotation => 0,
            Channel::Translation => 1,
            Channel::Scale => {
                debug_assert!(self.num_channels_per_bone == 3);
                2
            }
        };
        bone_index as usize * self.num_channels_per_bone + channel_offset
    }

    /// Finds the slot caching `bit_rate`, reserving (and invalidating) the least recently used
    /// slot on a miss.
    fn find_slot(&mut self, bone_index: u32, channel: Channel, bit_rate: u8) -> (usize, usize) {
        let channel_index = self.channel_index(bone_index, channel);
        let entry = &mut self.channels[channel_index];

        if bit_rate == INVALID_BIT_RATE {
            if entry.invalid_slot.generation == 0 {
                // First use; samples cached here stay valid until the segment changes.
                entry.invalid_slot.generation = self.generation;
                self.generation += 1;
                bitset_reset(&mut entry.invalid_slot.valid, false);
            }
            return (channel_index, NUM_VARIABLE_SLOTS);
        }

        if let Some(slot_index) =
            entry.variable_slots.iter().position(|slot| slot.bit_rate == bit_rate && slot.generation != 0)
        {
            return (channel_index, slot_index);
        }

        // Evict the oldest slot for this bit rate.
        let (slot_index, _) = entry
            .variable_slots
            .iter()
            .enumerate()
            .min_by_key(|(_, slot)| slot.generation)
            .unwrap();

        let slot = &mut entry.variable_slots[slot_index];
        slot.bit_rate = bit_rate;
        slot.generation = self.generation;
        bitset_reset(&mut slot.valid, false);

        self.generation += 1;
        debug_assert!(self.generation < u32::MAX - 8, "generation counter is about to wrap");

        (channel_index, slot_index)
    }

    fn sample(
        &mut self,
        args: &DecodeArgs<'_>,
        bone_index: u32,
        channel: Channel,
        sample_index: u32,
        bit_rate: u8,
    ) -> Vec4 {
        let segment = &args.lossy.segments[args.segment_index];
        let bone_stream = &segment.bone_streams[bone_index as usize];

        // Constant and default tracks decode identically at every sample; cache them once.
        let is_single_valued = match channel {
            Channel::Rotation => !bone_stream.is_rotation_animated(),
            Channel::Translation => !bone_stream.is_translation_animated(),
            Channel::Scale => !bone_stream.is_scale_animated(),
        } || is_constant_bit_rate(bit_rate);

        let cached_sample_index = if is_single_valued { 0 } else { sample_index };

        let (channel_index, slot_index) = self.find_slot(bone_index, channel, bit_rate);
        let entry = &mut self.channels[channel_index];
        let slot = if slot_index == NUM_VARIABLE_SLOTS {
            &mut entry.invalid_slot
        }
        else {
            &mut entry.variable_slots[slot_index]
        };

        if bitset_test(&slot.valid, cached_sample_index) {
            return slot.values[cached_sample_index as usize];
        }

        let value = match channel {
            Channel::Rotation => decode_rotation(args, bone_index, sample_index, bit_rate),
            Channel::Translation => decode_translation(args, bone_index, sample_index, bit_rate),
            Channel::Scale => decode_scale(args, bone_index, sample_index, bit_rate),
        };

        slot.values[cached_sample_index as usize] = value;
        bitset_set(&mut slot.valid, cached_sample_index, true);

        value
    }

    /// Returns the decoded rotation of `bone_index` at `sample_index` under the trial
    /// `bit_rate`, as a normalized quaternion in vector form. Bit-exact with the miss path.
    pub fn sample_rotation(
        &mut self,
        args: &DecodeArgs<'_>,
        bone_index: u32,
        sample_index: u32,
        bit_rate: u8,
    ) -> Quat {
        let value = self.sample(args, bone_index, Channel::Rotation, sample_index, bit_rate);
        vec4_to_quat(value)
    }

    pub fn sample_translation(
        &mut self,
        args: &DecodeArgs<'_>,
        bone_index: u32,
        sample_index: u32,
        bit_rate: u8,
    ) -> Vec4 {
        self.sample(args, bone_index, Channel::Translation, sample_index, bit_rate)
    }

    pub fn sample_scale(
        &mut self,
        args: &DecodeArgs<'_>,
        bone_index: u32,
        sample_index: u32,
        bit_rate: u8,
    ) -> Vec4 {
        self.sample(args, bone_index, Channel::Scale, sample_index, bit_rate)
    }
}

/// Decodes a rotation the way the runtime will see it: quantized at `bit_rate`, range reduced
/// and expanded, W reconstructed, normalized.
fn decode_rotation(args: &DecodeArgs<'_>, bone_index: u32, sample_index: u32, bit_rate: u8) -> Vec4 {
    let segment = &args.lossy.segments[args.segment_index];
    let bone_stream = &segment.bone_streams[bone_index as usize];
    let raw_stream = &args.raw.segments[0].bone_streams[bone_index as usize];
    let rotation_format = args.settings.rotation_format;

    if bone_stream.is_rotation_default {
        return quat_to_vec4(Quat::IDENTITY);
    }

    let rotation = if bit_rate == INVALID_BIT_RATE {
        if bone_stream.is_rotation_constant {
            let raw = vec4_to_quat(raw_stream.rotations[0]);
            rotation_from_components(quat_to_vec4(quat_ensure_positive_w(raw)), rotation_format)
        }
        else {
            // Full-precision storage; undo the range reduction the stream carries.
            let mut value = bone_stream.rotations[sample_index as usize];
            if segment.are_rotations_normalized {
                value = expand_vec4(value, &segment.ranges[bone_index as usize].rotation);
            }
            if args.lossy.are_rotations_normalized {
                value = expand_vec4(value, &args.lossy.ranges[bone_index as usize].rotation);
            }
            rotation_from_components(value, rotation_format)
        }
    }
    else if is_constant_bit_rate(bit_rate) {
        // One sample, stored in the segment range slot in clip-range space at 16 bits per
        // component.
        let raw_sample_index = segment.clip_sample_offset as usize;
        let raw = vec4_to_quat(args.raw.segments[0].bone_streams[bone_index as usize].rotations[raw_sample_index]);
        let converted = quat_to_vec4(quat_ensure_positive_w(raw));

        let clip_range = &args.lossy.ranges[bone_index as usize].rotation;
        let normalized = normalize_vec4(converted, clip_range);
        let decayed = decay_vec3_unsigned(normalized.truncate(), CONSTANT_BIT_RATE_NUM_BITS).extend(normalized.w);
        let value = expand_vec4(decayed, clip_range);

        rotation_from_components(value, rotation_format)
    }
    else if is_raw_bit_rate(bit_rate) {
        let raw_sample_index = (segment.clip_sample_offset + sample_index) as usize;
        let raw = vec4_to_quat(raw_stream.rotations[raw_sample_index]);
        rotation_from_components(quat_to_vec4(quat_ensure_positive_w(raw)), rotation_format)
    }
    else {
        let num_bits = num_bits_at_bit_rate(bit_rate);
        let normalized = bone_stream.rotations[sample_index as usize];
        let mut value = decay_vec3_unsigned(normalized.truncate(), num_bits).extend(normalized.w);

        if segment.are_rotations_normalized {
            value = expand_vec4(value, &segment.ranges[bone_index as usize].rotation);
        }
        if args.lossy.are_rotations_normalized {
            value = expand_vec4(value, &args.lossy.ranges[bone_index as usize].rotation);
        }

        rotation_from_components(value, rotation_format)
    };

    quat_to_vec4(rotation.normalize())
}

fn decode_translation(args: &DecodeArgs<'_>, bone_index: u32, sample_index: u32, bit_rate: u8) -> Vec4 {
    let segment = &args.lossy.segments[args.segment_index];
    let bone_stream = &segment.bone_streams[bone_index as usize];
    let raw_stream = &args.raw.segments[0].bone_streams[bone_index as usize];

    if bone_stream.is_translation_default {
        return Vec4::ZERO;
    }

    if bit_rate == INVALID_BIT_RATE {
        if bone_stream.is_translation_constant {
            return raw_stream.translations[0];
        }

        let mut value = bone_stream.translations[sample_index as usize];
        if segment.are_translations_normalized {
            value = expand_vec4(value, &segment.ranges[bone_index as usize].translation);
        }
        if args.lossy.are_translations_normalized {
            value = expand_vec4(value, &args.lossy.ranges[bone_index as usize].translation);
        }
        return value;
    }

    if is_constant_bit_rate(bit_rate) {
        let raw_sample_index = segment.clip_sample_offset as usize;
        let raw = raw_stream.translations[raw_sample_index];

        let clip_range = &args.lossy.ranges[bone_index as usize].translation;
        let normalized = normalize_vec4(raw, clip_range);
        let decayed =
            decay_vec3_unsigned(normalized.truncate(), CONSTANT_BIT_RATE_NUM_BITS).extend(0.0);
        return expand_vec4(decayed, clip_range);
    }

    if is_raw_bit_rate(bit_rate) {
        let raw_sample_index = (segment.clip_sample_offset + sample_index) as usize;
        return raw_stream.translations[raw_sample_index];
    }

    let num_bits = num_bits_at_bit_rate(bit_rate);
    let normalized = bone_stream.translations[sample_index as usize];
    let mut value = decay_vec3_unsigned(normalized.truncate(), num_bits).extend(0.0);

    if segment.are_translations_normalized {
        value = expand_vec4(value, &segment.ranges[bone_index as usize].translation);
    }
    if args.lossy.are_translations_normalized {
        value = expand_vec4(value, &args.lossy.ranges[bone_index as usize].translation);
    }
    value
}

fn decode_scale(args: &DecodeArgs<'_>, bone_index: u32, sample_index: u32, bit_rate: u8) -> Vec4 {
    let segment = &args.lossy.segments[args.segment_index];
    let bone_stream = &segment.bone_streams[bone_index as usize];
    let raw_stream = &args.raw.segments[0].bone_streams[bone_index as usize];

    if bone_stream.is_scale_default {
        return Vec4::new(1.0, 1.0, 1.0, 0.0);
    }

    if bit_rate == INVALID_BIT_RATE {
        if bone_stream.is_scale_constant {
            return raw_stream.scales[0];
        }

        let mut value = bone_stream.scales[sample_index as usize];
        if segment.are_scales_normalized {
            value = expand_vec4(value, &segment.ranges[bone_index as usize].scale);
        }
        if args.lossy.are_scales_normalized {
            value = expand_vec4(value, &args.lossy.ranges[bone_index as usize].scale);
        }
        return value;
    }

    if is_constant_bit_rate(bit_rate) {
        let raw_sample_index = segment.clip_sample_offset as usize;
        let raw = raw_stream.scales[raw_sample_index];

        let clip_range = &args.lossy.ranges[bone_index as usize].scale;
        let normalized = normalize_vec4(raw, clip_range);
        let decayed =
            decay_vec3_unsigned(normalized.truncate(), CONSTANT_BIT_RATE_NUM_BITS).extend(0.0);
        return expand_vec4(decayed, clip_range);
    }

    if is_raw_bit_rate(bit_rate) {
        let raw_sample_index = (segment.clip_sample_offset + sample_index) as usize;
        return raw_stream.scales[raw_sample_index];
    }

    let num_bits = num_bits_at_bit_rate(bit_rate);
    let normalized = bone_stream.scales[sample_index as usize];
    let mut value = decay_vec3_unsigned(normalized.truncate(), num_bits).extend(0.0);

    if segment.are_scales_normalized {
        value = expand_vec4(value, &segment.ranges[bone_index as usize].scale);
    }
    if args.lossy.are_scales_normalized {
        value = expand_vec4(value, &args.lossy.ranges[bone_index as usize].scale);
    }
    value
}

fn quat_to_vec4(rotation: Quat) -> Vec4 {
    Vec4::new(rotation.x, rotation.y, rotation.z, rotation.w)
}

fn rotation_from_components(value: Vec4, rotation_format: RotationFormat) -> Quat {
    match rotation_format {
        RotationFormat::QuatFull => vec4_to_quat(value),
        _ => quat_from_positive_w(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_lru_eviction_prefers_oldest() {
        let mut cache = SampleCache::new(1, false, 4);

        // Fill the four variable slots.
        for bit_rate in [3u8, 4, 5, 6] {
            cache.find_slot(0, Channel::Rotation, bit_rate);
        }

        // Touch bit rate 3 again: a hit, no eviction.
        let (_, slot_for_3) = cache.find_slot(0, Channel::Rotation, 3);

        // A fifth bit rate must evict the oldest untouched slot (bit rate 4).
        let (channel_index, new_slot) = cache.find_slot(0, Channel::Rotation, 7);
        assert_ne!(new_slot, slot_for_3);
        assert_eq!(cache.channels[channel_index].variable_slots[new_slot].bit_rate, 7);
        assert!(!cache.channels[channel_index]
            .variable_slots
            .iter()
            .any(|slot| slot.bit_rate == 4 && slot.generation != 0));
    }

    #[test]
    fn verify_reset_clears_slots() {
        let mut cache = SampleCache::new(1, true, 4);
        cache.find_slot(0, Channel::Scale, 5);
        cache.reset(8);

        let channel_index = cache.channel_index(0, Channel::Scale);
        assert!(cache.channels[channel_index]
            .variable_slots
            .iter()
            .all(|slot| slot.generation == 0));
        assert_eq!(cache.channels[channel_index].invalid_slot.values.len(), 8);
    }
}
