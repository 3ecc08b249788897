// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `quantize` module assigns each bone's channels a variable bit rate.
//!
//! The search runs per segment in two phases. Phase one primes each bone independently with the
//! cheapest bit-rate triple whose local-space error meets the threshold: if a parent were
//! lossless this is exactly what the bone needs, and a lossy parent can only demand more bits,
//! never fewer. Phase two walks the hierarchy from the roots down and, wherever the
//! object-space error still exceeds the threshold, distributes one to three extra bits over the
//! ancestor chain, keeping the permutation that helps the most. A greedy child-to-parent
//! fallback and a final max-out pass handle the stubborn leftovers.

use choreia_core::math::{quat_nlerp, vec4_to_quat, Qvv};

use crate::bit_rate::{
    num_bits_at_bit_rate, BoneBitRates, HIGHEST_BIT_RATE, INVALID_BIT_RATE, LOWEST_BIT_RATE,
    LOCAL_BIT_RATE_PERMUTATIONS, LOCAL_BIT_RATE_PERMUTATIONS_NO_SCALE,
};
use crate::compression::clip_context::ClipContext;
use crate::compression::sample_cache::{DecodeArgs, SampleCache};
use crate::error_metric::TransformErrorMetric;
use crate::settings::{CompressionLevel, CompressionSettings};
use crate::tracks::Skeleton;

use glam::Vec4;
use log::debug;

/// Whether an error sweep over the segment stops early.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ErrorScanStopCondition {
    /// Stop at the first sample exceeding the threshold; candidates are rejected as soon as
    /// they fail.
    UntilErrorTooHigh,
    /// Sweep the whole segment so the true maximum is known.
    UntilEndOfSegment,
}

struct QuantizationContext<'a> {
    settings: &'a CompressionSettings,
    metric: &'a dyn TransformErrorMetric,
    skeleton: &'a Skeleton,
    lossy: &'a ClipContext,
    raw: &'a ClipContext,
    segment_index: usize,

    num_bones: u32,
    num_samples: u32,
    has_scale: bool,

    bit_rates: Vec<BoneBitRates>,
    cache: SampleCache,

    raw_pose: Vec<Qvv>,
    lossy_pose: Vec<Qvv>,
}

impl<'a> QuantizationContext<'a> {
    fn raw_transform(&self, bone_index: u32, sample_index: u32) -> Qvv {
        let clip_sample_index =
            (self.lossy.segments[self.segment_index].clip_sample_offset + sample_index) as usize;
        let stream = &self.raw.segments[0].bone_streams[bone_index as usize];

        Qvv::new(
            vec4_to_quat(stream.rotations[clip_sample_index]).normalize(),
            stream.translations[clip_sample_index].truncate(),
            stream.scales[clip_sample_index].truncate(),
        )
    }

    fn lossy_transform(&mut self, bone_index: u32, sample_index: u32) -> Qvv {
        let args = DecodeArgs {
            lossy: self.lossy,
            raw: self.raw,
            segment_index: self.segment_index,
            settings: self.settings,
        };
        let bit_rates = self.bit_rates[bone_index as usize];

        let rotation = self.cache.sample_rotation(&args, bone_index, sample_index, bit_rates.rotation);
        let translation =
            self.cache.sample_translation(&args, bone_index, sample_index, bit_rates.translation);
        let scale = if self.has_scale {
            self.cache.sample_scale(&args, bone_index, sample_index, bit_rates.scale)
        }
        else {
            Vec4::new(1.0, 1.0, 1.0, 0.0)
        };

        Qvv::new(rotation, translation.truncate(), scale.truncate())
    }

    /// Measures the maximum local-space error of `bone_index` over the segment under the
    /// current bit rates.
    fn max_error_local(&mut self, bone_index: u32, stop_condition: ErrorScanStopCondition) -> f32 {
        let mut max_error = 0.0f32;

        for sample_index in 0..self.num_samples {
            self.raw_pose[bone_index as usize] = self.raw_transform(bone_index, sample_index);
            self.lossy_pose[bone_index as usize] = self.lossy_transform(bone_index, sample_index);

            let error = if self.has_scale {
                self.metric.calculate_local_bone_error(
                    self.skeleton,
                    &self.raw_pose,
                    &[],
                    &self.lossy_pose,
                    bone_index,
                )
            }
            else {
                self.metric.calculate_local_bone_error_no_scale(
                    self.skeleton,
                    &self.raw_pose,
                    &[],
                    &self.lossy_pose,
                    bone_index,
                )
            };

            max_error = max_error.max(error);
            if stop_condition == ErrorScanStopCondition::UntilErrorTooHigh
                && error >= self.settings.error_threshold
            {
                break;
            }
        }

        max_error
    }

    /// Measures the maximum object-space error of `bone_index` over the segment under the
    /// current bit rates, accounting for every lossy ancestor.
    fn max_error_object(&mut self, bone_index: u32, stop_condition: ErrorScanStopCondition) -> f32 {
        let chain = self.skeleton.bone_chain(bone_index);
        let mut max_error = 0.0f32;

        for sample_index in 0..self.num_samples {
            for &chain_bone_index in chain.iter() {
                self.raw_pose[chain_bone_index as usize] =
                    self.raw_transform(chain_bone_index, sample_index);
                self.lossy_pose[chain_bone_index as usize] =
                    self.lossy_transform(chain_bone_index, sample_index);
            }

            let error = if self.has_scale {
                self.metric.calculate_object_bone_error(
                    self.skeleton,
                    &self.raw_pose,
                    &[],
                    &self.lossy_pose,
                    bone_index,
                )
            }
            else {
                self.metric.calculate_object_bone_error_no_scale(
                    self.skeleton,
                    &self.raw_pose,
                    &[],
                    &self.lossy_pose,
                    bone_index,
                )
            };

            max_error = max_error.max(error);
            if stop_condition == ErrorScanStopCondition::UntilErrorTooHigh
                && error >= self.settings.error_threshold
            {
                break;
            }
        }

        max_error
    }
}

/// Seeds every bone's bit rates: 0 where the segment can hold a constant sample, the lowest
/// rate where it cannot, and invalid for constant/default tracks and non-variable formats.
fn initialize_bone_bit_rates(
    lossy: &ClipContext,
    segment_index: usize,
    settings: &CompressionSettings,
    out_bit_rates: &mut [BoneBitRates],
) {
    let segment = &lossy.segments[segment_index];

    let is_rotation_variable = settings.rotation_format.is_variable();
    let is_translation_variable = settings.translation_format.is_variable();
    let is_scale_variable = lossy.has_scale && settings.scale_format.is_variable();

    for (bone_stream, bit_rates) in segment.bone_streams.iter().zip(out_bit_rates.iter_mut()) {
        bit_rates.rotation = if is_rotation_variable && bone_stream.is_rotation_animated() {
            if segment.are_rotations_normalized {
                0
            }
            else {
                LOWEST_BIT_RATE
            }
        }
        else {
            INVALID_BIT_RATE
        };

        bit_rates.translation = if is_translation_variable && bone_stream.is_translation_animated() {
            if segment.are_translations_normalized {
                0
            }
            else {
                LOWEST_BIT_RATE
            }
        }
        else {
            INVALID_BIT_RATE
        };

        bit_rates.scale = if is_scale_variable && bone_stream.is_scale_animated() {
            if segment.are_scales_normalized {
                0
            }
            else {
                LOWEST_BIT_RATE
            }
        }
        else {
            INVALID_BIT_RATE
        };
    }
}

/// Returns whether a permutation entry is compatible with the seeded bit rate: tracks seeded at
/// 0 only accept 0, tracks seeded at the lowest rate never accept 0, and invalid tracks only
/// accept 0 (which maps back to invalid).
fn permutation_entry_compatible(seeded: u8, candidate: u8) -> bool {
    match seeded {
        0 => true,
        LOWEST_BIT_RATE => candidate != 0,
        INVALID_BIT_RATE => candidate == 0,
        _ => unreachable!("unexpected seeded bit rate"),
    }
}

/// Phase one: pick each bone's cheapest bit-rate triple meeting the threshold in local space.
fn calculate_local_space_bit_rates(context: &mut QuantizationContext<'_>) {
    let error_threshold = context.settings.error_threshold;

    for bone_index in 0..context.num_bones {
        let seeded = context.bit_rates[bone_index as usize];

        if seeded.is_fully_invalid() {
            // Every track is constant or default, nothing to search.
            continue;
        }

        let mut best_bit_rates = seeded;
        let mut best_error = 1.0e10f32;
        let mut prev_transform_size = u32::MAX;
        let mut is_error_good_enough = false;

        if context.has_scale {
            for permutation in LOCAL_BIT_RATE_PERMUTATIONS.iter() {
                let [rotation_rate, translation_rate, scale_rate] = *permutation;

                if !permutation_entry_compatible(seeded.rotation, rotation_rate)
                    || !permutation_entry_compatible(seeded.translation, translation_rate)
                    || !permutation_entry_compatible(seeded.scale, scale_rate)
                {
                    continue;
                }

                let transform_size = num_bits_at_bit_rate(rotation_rate)
                    + num_bits_at_bit_rate(translation_rate)
                    + num_bits_at_bit_rate(scale_rate);

                if transform_size != prev_transform_size && is_error_good_enough {
                    // The cheapest size already met the threshold and every permutation of
                    // that size has been tried.
                    break;
                }
                prev_transform_size = transform_size;

                context.bit_rates[bone_index as usize] = BoneBitRates {
                    rotation: if seeded.rotation != INVALID_BIT_RATE { rotation_rate } else { INVALID_BIT_RATE },
                    translation: if seeded.translation != INVALID_BIT_RATE { translation_rate } else { INVALID_BIT_RATE },
                    scale: if seeded.scale != INVALID_BIT_RATE { scale_rate } else { INVALID_BIT_RATE },
                };

                let error =
                    context.max_error_local(bone_index, ErrorScanStopCondition::UntilErrorTooHigh);

                if error < best_error {
                    best_error = error;
                    best_bit_rates = context.bit_rates[bone_index as usize];
                    is_error_good_enough = error < error_threshold;
                }
            }
        }
        else {
            for permutation in LOCAL_BIT_RATE_PERMUTATIONS_NO_SCALE.iter() {
                let [rotation_rate, translation_rate] = *permutation;

                if !permutation_entry_compatible(seeded.rotation, rotation_rate)
                    || !permutation_entry_compatible(seeded.translation, translation_rate)
                {
                    continue;
                }

                let transform_size =
                    num_bits_at_bit_rate(rotation_rate) + num_bits_at_bit_rate(translation_rate);

                if transform_size != prev_transform_size && is_error_good_enough {
                    break;
                }
                prev_transform_size = transform_size;

                context.bit_rates[bone_index as usize] = BoneBitRates {
                    rotation: if seeded.rotation != INVALID_BIT_RATE { rotation_rate } else { INVALID_BIT_RATE },
                    translation: if seeded.translation != INVALID_BIT_RATE { translation_rate } else { INVALID_BIT_RATE },
                    scale: INVALID_BIT_RATE,
                };

                let error =
                    context.max_error_local(bone_index, ErrorScanStopCondition::UntilErrorTooHigh);

                if error < best_error {
                    best_error = error;
                    best_bit_rates = context.bit_rates[bone_index as usize];
                    is_error_good_enough = error < error_threshold;
                }
            }
        }

        context.bit_rates[bone_index as usize] = best_bit_rates;
    }
}

#[inline]
fn increment_and_clamp_bit_rate(bit_rate: u8, increment: u8) -> u8 {
    if bit_rate >= HIGHEST_BIT_RATE {
        bit_rate
    }
    else {
        (bit_rate + increment).min(HIGHEST_BIT_RATE)
    }
}

/// Tries every way of spending `num_increments` extra bits on one bone's three channels,
/// returning the best error found and the rates achieving it.
fn increase_bone_bit_rate(
    context: &mut QuantizationContext<'_>,
    bone_index: u32,
    num_increments: u8,
    old_error: f32,
    out_best_bit_rates: &mut BoneBitRates,
) -> f32 {
    let bone_bit_rates = context.bit_rates[bone_index as usize];
    let num_scale_increments = if context.has_scale { num_increments } else { 0 };

    let mut best_bit_rates = bone_bit_rates;
    let mut best_error = old_error;

    for rotation_increment in 0..=num_increments {
        let rotation_rate = increment_and_clamp_bit_rate(bone_bit_rates.rotation, rotation_increment);

        for translation_increment in 0..=num_increments {
            let translation_rate =
                increment_and_clamp_bit_rate(bone_bit_rates.translation, translation_increment);

            for scale_increment in 0..=num_scale_increments {
                let scale_rate = increment_and_clamp_bit_rate(bone_bit_rates.scale, scale_increment);

                if rotation_increment + translation_increment + scale_increment != num_increments {
                    if scale_rate >= HIGHEST_BIT_RATE {
                        break;
                    }
                    continue;
                }

                context.bit_rates[bone_index as usize] =
                    BoneBitRates { rotation: rotation_rate, translation: translation_rate, scale: scale_rate };
                let error =
                    context.max_error_object(bone_index, ErrorScanStopCondition::UntilErrorTooHigh);

                if error < best_error {
                    best_error = error;
                    best_bit_rates = context.bit_rates[bone_index as usize];
                }

                context.bit_rates[bone_index as usize] = bone_bit_rates;

                if scale_rate >= HIGHEST_BIT_RATE {
                    break;
                }
            }

            if translation_rate >= HIGHEST_BIT_RATE {
                break;
            }
        }

        if rotation_rate >= HIGHEST_BIT_RATE {
            break;
        }
    }

    *out_best_bit_rates = best_bit_rates;
    best_error
}

/// Rearranges `values` into the next lexicographic permutation, returning false once the
/// sequence wraps back to sorted order.
fn next_permutation(values: &mut [u8]) -> bool {
    if values.len() < 2 {
        return false;
    }

    let mut pivot = values.len() - 1;
    while pivot > 0 && values[pivot - 1] >= values[pivot] {
        pivot -= 1;
    }

    if pivot == 0 {
        values.reverse();
        return false;
    }

    let mut successor = values.len() - 1;
    while values[successor] <= values[pivot - 1] {
        successor -= 1;
    }

    values.swap(pivot - 1, successor);
    values[pivot..].reverse();
    true
}

/// Evaluates every arrangement of the increment multiset `chain_permutation` over the ancestor
/// chain, keeping the best full-chain bit-rate assignment in `best_bit_rates`.
#[allow(clippy::too_many_arguments)]
fn calculate_bone_permutation_error(
    context: &mut QuantizationContext<'_>,
    chain_permutation: &mut [u8],
    chain_bone_indices: &[u32],
    bone_index: u32,
    permutation_bit_rates: &mut [BoneBitRates],
    best_bit_rates: &mut [BoneBitRates],
    old_error: f32,
) -> f32 {
    let error_threshold = context.settings.error_threshold;
    let mut best_error = old_error;

    loop {
        permutation_bit_rates.copy_from_slice(&context.bit_rates);

        let mut is_permutation_valid = false;
        for (chain_link_index, &num_increments) in chain_permutation.iter().enumerate() {
            if num_increments == 0 {
                continue;
            }

            let chain_bone_index = chain_bone_indices[chain_link_index];
            let mut chain_bone_best_bit_rates = BoneBitRates::INVALID;
            increase_bone_bit_rate(
                context,
                chain_bone_index,
                num_increments,
                old_error,
                &mut chain_bone_best_bit_rates,
            );

            is_permutation_valid |=
                chain_bone_best_bit_rates != permutation_bit_rates[chain_bone_index as usize];
            permutation_bit_rates[chain_bone_index as usize] = chain_bone_best_bit_rates;
        }

        if is_permutation_valid {
            let saved = std::mem::replace(&mut context.bit_rates, permutation_bit_rates.to_vec());
            let permutation_error =
                context.max_error_object(bone_index, ErrorScanStopCondition::UntilErrorTooHigh);
            context.bit_rates = saved;

            if permutation_error < best_error {
                best_error = permutation_error;
                best_bit_rates.copy_from_slice(permutation_bit_rates);

                if permutation_error < error_threshold {
                    break;
                }
            }
        }

        if !next_permutation(chain_permutation) {
            break;
        }
    }

    best_error
}

/// Phase two plus fallbacks: see the module documentation.
fn find_optimal_bit_rates(context: &mut QuantizationContext<'_>) {
    let error_threshold = context.settings.error_threshold;
    let num_bones = context.num_bones as usize;

    let mut chain_permutation = vec![0u8; num_bones];
    let mut permutation_bit_rates = vec![BoneBitRates::INVALID; num_bones];
    let mut best_permutation_bit_rates = vec![BoneBitRates::INVALID; num_bones];
    let mut best_bit_rates = context.bit_rates.clone();

    for bone_index in 0..context.num_bones {
        let mut error =
            context.max_error_object(bone_index, ErrorScanStopCondition::UntilErrorTooHigh);
        if error < error_threshold {
            continue;
        }

        let bone_rates = context.bit_rates[bone_index as usize];
        if bone_rates.rotation >= HIGHEST_BIT_RATE
            && bone_rates.translation >= HIGHEST_BIT_RATE
            && bone_rates.scale >= HIGHEST_BIT_RATE
        {
            // The bone is already at the highest precision possible locally. If even the local
            // error exceeds the threshold there is nothing more to be done for it.
            let local_error =
                context.max_error_local(bone_index, ErrorScanStopCondition::UntilErrorTooHigh);
            if local_error >= error_threshold {
                continue;
            }
        }

        let chain = context.skeleton.bone_chain(bone_index);
        let chain_bone_indices: Vec<u32> = chain.to_vec();
        let num_bones_in_chain = chain_bone_indices.len();

        let initial_error = error;

        while error >= error_threshold {
            let original_error = error;
            let mut best_error = error;

            // Distribute a single extra bit somewhere along the chain.
            chain_permutation[..num_bones_in_chain].fill(0);
            chain_permutation[num_bones_in_chain - 1] = 1;
            error = calculate_bone_permutation_error(
                context,
                &mut chain_permutation[..num_bones_in_chain],
                &chain_bone_indices,
                bone_index,
                &mut permutation_bit_rates,
                &mut best_permutation_bit_rates,
                original_error,
            );
            if error < best_error {
                best_error = error;
                best_bit_rates.copy_from_slice(&best_permutation_bit_rates);
                if error < error_threshold {
                    break;
                }
            }

            if context.settings.level >= CompressionLevel::High {
                // Two extra bits, either on one bone or split over two.
                chain_permutation[..num_bones_in_chain].fill(0);
                chain_permutation[num_bones_in_chain - 1] = 2;
                error = calculate_bone_permutation_error(
                    context,
                    &mut chain_permutation[..num_bones_in_chain],
                    &chain_bone_indices,
                    bone_index,
                    &mut permutation_bit_rates,
                    &mut best_permutation_bit_rates,
                    original_error,
                );
                if error < best_error {
                    best_error = error;
                    best_bit_rates.copy_from_slice(&best_permutation_bit_rates);
                    if error < error_threshold {
                        break;
                    }
                }

                if num_bones_in_chain > 1 {
                    chain_permutation[..num_bones_in_chain].fill(0);
                    chain_permutation[num_bones_in_chain - 2] = 1;
                    chain_permutation[num_bones_in_chain - 1] = 1;
                    error = calculate_bone_permutation_error(
                        context,
                        &mut chain_permutation[..num_bones_in_chain],
                        &chain_bone_indices,
                        bone_index,
                        &mut permutation_bit_rates,
                        &mut best_permutation_bit_rates,
                        original_error,
                    );
                    if error < best_error {
                        best_error = error;
                        best_bit_rates.copy_from_slice(&best_permutation_bit_rates);
                        if error < error_threshold {
                            break;
                        }
                    }
                }
            }

            if context.settings.level >= CompressionLevel::Highest {
                // Three extra bits over one, two, or three bones.
                chain_permutation[..num_bones_in_chain].fill(0);
                chain_permutation[num_bones_in_chain - 1] = 3;
                error = calculate_bone_permutation_error(
                    context,
                    &mut chain_permutation[..num_bones_in_chain],
                    &chain_bone_indices,
                    bone_index,
                    &mut permutation_bit_rates,
                    &mut best_permutation_bit_rates,
                    original_error,
                );
                if error < best_error {
                    best_error = error;
                    best_bit_rates.copy_from_slice(&best_permutation_bit_rates);
                    if error < error_threshold {
                        break;
                    }
                }

                if num_bones_in_chain > 1 {
                    chain_permutation[..num_bones_in_chain].fill(0);
                    chain_permutation[num_bones_in_chain - 2] = 1;
                    chain_permutation[num_bones_in_chain - 1] = 2;
                    error = calculate_bone_permutation_error(
                        context,
                        &mut chain_permutation[..num_bones_in_chain],
                        &chain_bone_indices,
                        bone_index,
                        &mut permutation_bit_rates,
                        &mut best_permutation_bit_rates,
                        original_error,
                    );
                    if error < best_error {
                        best_error = error;
                        best_bit_rates.copy_from_slice(&best_permutation_bit_rates);
                        if error < error_threshold {
                            break;
                        }
                    }

                    if num_bones_in_chain > 2 {
                        chain_permutation[..num_bones_in_chain].fill(0);
                        chain_permutation[num_bones_in_chain - 3] = 1;
                        chain_permutation[num_bones_in_chain - 2] = 1;
                        chain_permutation[num_bones_in_chain - 1] = 1;
                        error = calculate_bone_permutation_error(
                            context,
                            &mut chain_permutation[..num_bones_in_chain],
                            &chain_bone_indices,
                            bone_index,
                            &mut permutation_bit_rates,
                            &mut best_permutation_bit_rates,
                            original_error,
                        );
                        if error < best_error {
                            best_error = error;
                            best_bit_rates.copy_from_slice(&best_permutation_bit_rates);
                            if error < error_threshold {
                                break;
                            }
                        }
                    }
                }
            }

            if best_error >= original_error {
                // No permutation made progress.
                break;
            }

            error = best_error;
            if error < original_error {
                context.bit_rates.copy_from_slice(&best_bit_rates);
            }
        }

        if error < initial_error {
            context.bit_rates.copy_from_slice(&best_bit_rates);
        }

        // The error may remain too high; this should be rare. Greedily raise the cheapest
        // channel from the child towards the root, backtracking when raising stops helping.
        error = context.max_error_object(bone_index, ErrorScanStopCondition::UntilEndOfSegment);
        while error >= error_threshold {
            let mut num_maxed_out = 0;

            for chain_link_index in (0..num_bones_in_chain).rev() {
                let chain_bone_index = chain_bone_indices[chain_link_index] as usize;

                let mut best_bone_bit_rates = context.bit_rates[chain_bone_index];
                let mut best_bit_rate_error = error;

                while error >= error_threshold {
                    let bone_bit_rates = &mut context.bit_rates[chain_bone_index];

                    let rates =
                        [bone_bit_rates.rotation, bone_bit_rates.translation, bone_bit_rates.scale];
                    let smallest = *rates.iter().min().unwrap();

                    if smallest >= HIGHEST_BIT_RATE {
                        num_maxed_out += 1;
                        break;
                    }

                    // When rotation and translation tie, biasing translation tends to win by a
                    // hair.
                    if bone_bit_rates.rotation == bone_bit_rates.translation
                        && bone_bit_rates.translation < HIGHEST_BIT_RATE
                        && bone_bit_rates.scale >= HIGHEST_BIT_RATE
                    {
                        bone_bit_rates.translation += 1;
                    }
                    else if bone_bit_rates.rotation == smallest {
                        bone_bit_rates.rotation += 1;
                    }
                    else if bone_bit_rates.translation == smallest {
                        bone_bit_rates.translation += 1;
                    }
                    else {
                        bone_bit_rates.scale += 1;
                    }

                    error = context
                        .max_error_object(bone_index, ErrorScanStopCondition::UntilEndOfSegment);

                    if error < best_bit_rate_error {
                        best_bone_bit_rates = context.bit_rates[chain_bone_index];
                        best_bit_rate_error = error;
                    }
                }

                // Only retain the bit rates with the lowest error.
                context.bit_rates[chain_bone_index] = best_bone_bit_rates;
                error = best_bit_rate_error;

                if error < error_threshold {
                    break;
                }
            }

            if num_maxed_out == num_bones_in_chain {
                break;
            }
        }

        // Every heuristic failed; stop caring about size and max the chain out from the child
        // towards the root. Only full-precision rotations are guaranteed to ever reach the
        // threshold: drop-W formats can carry a high error even with raw component values, in
        // which case the best available budget is recorded and accepted.
        if error >= error_threshold
            && context.settings.rotation_format == crate::settings::RotationFormat::QuatFull
        {
            for chain_link_index in (0..num_bones_in_chain).rev() {
                let chain_bone_index = chain_bone_indices[chain_link_index] as usize;
                let bone_bit_rates = &mut context.bit_rates[chain_bone_index];
                bone_bit_rates.rotation = bone_bit_rates.rotation.max(HIGHEST_BIT_RATE);
                bone_bit_rates.translation = bone_bit_rates.translation.max(HIGHEST_BIT_RATE);
                bone_bit_rates.scale = bone_bit_rates.scale.max(HIGHEST_BIT_RATE);

                error =
                    context.max_error_object(bone_index, ErrorScanStopCondition::UntilEndOfSegment);
                if error < error_threshold {
                    break;
                }
            }
        }
    }
}

/// Runs the bit-rate search over every segment of the clip, storing the chosen rates into the
/// segments.
pub(crate) fn quantize_streams(
    lossy: &mut ClipContext,
    raw: &ClipContext,
    skeleton: &Skeleton,
    settings: &CompressionSettings,
    metric: &dyn TransformErrorMetric,
) {
    let num_bones = lossy.num_bones;
    let has_scale = lossy.has_scale;

    let mut cache = SampleCache::new(num_bones, has_scale, 0);

    for segment_index in 0..lossy.segments.len() {
        let num_samples = lossy.segments[segment_index].num_samples;
        cache.reset(num_samples);

        let mut bit_rates = vec![BoneBitRates::INVALID; num_bones as usize];
        initialize_bone_bit_rates(lossy, segment_index, settings, &mut bit_rates);

        let mut context = QuantizationContext {
            settings,
            metric,
            skeleton,
            lossy,
            raw,
            segment_index,
            num_bones,
            num_samples,
            has_scale,
            bit_rates,
            cache,
            raw_pose: vec![Qvv::IDENTITY; num_bones as usize],
            lossy_pose: vec![Qvv::IDENTITY; num_bones as usize],
        };

        calculate_local_space_bit_rates(&mut context);
        find_optimal_bit_rates(&mut context);

        let QuantizationContext { bit_rates, cache: returned_cache, .. } = context;
        cache = returned_cache;

        debug!(
            "segment {}: quantized {} bones over {} samples",
            segment_index, num_bones, num_samples
        );

        lossy.segments[segment_index].bit_rates = bit_rates;
    }
}

/// Interpolates two decoded transforms; used by the contributing error pass.
pub(crate) fn interpolate_qvv(start: &Qvv, end: &Qvv, alpha: f32) -> Qvv {
    Qvv::new(
        quat_nlerp(start.rotation, end.rotation, alpha),
        start.translation.lerp(end.translation, alpha),
        start.scale.lerp(end.scale, alpha),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_next_permutation_enumerates_multiset() {
        let mut values = [0u8, 0, 1, 1];
        let mut seen = vec![values.to_vec()];

        while next_permutation(&mut values) {
            seen.push(values.to_vec());
        }

        // 4!/2!2! distinct arrangements.
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0], vec![0, 0, 1, 1]);
        assert_eq!(seen.last().unwrap(), &vec![1, 1, 0, 0]);

        // All distinct.
        let mut sorted = seen.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 6);
    }

    #[test]
    fn verify_increment_and_clamp() {
        assert_eq!(increment_and_clamp_bit_rate(5, 2), 7);
        assert_eq!(increment_and_clamp_bit_rate(17, 3), HIGHEST_BIT_RATE);
        assert_eq!(increment_and_clamp_bit_rate(HIGHEST_BIT_RATE, 1), HIGHEST_BIT_RATE);
        assert_eq!(increment_and_clamp_bit_rate(INVALID_BIT_RATE, 1), INVALID_BIT_RATE);
    }
}
