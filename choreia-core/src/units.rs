// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `units` module provides definitions for sample time arithmetic.
//!
//! A clip with 1 sample at any sample rate is a single static pose and as such has no definite
//! duration: we treat it as infinite. A clip with 2 samples at 30 Hz has a sample at time 0.0
//! and another at 1/30s, for a duration of 1/30s. A 0.0 duration has no samples at all.

/// Controls how a sample time falling between two keyframes is resolved.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SampleRoundingPolicy {
    /// Interpolate between the surrounding keyframes.
    #[default]
    None,
    /// Snap to the keyframe at or before the sample time.
    Floor,
    /// Snap to the keyframe at or after the sample time.
    Ceil,
    /// Snap to the nearest keyframe.
    Nearest,
}

/// The resolved keyframe pair and interpolation alpha for a sample time.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct InterpolationKeys {
    /// Index of the first keyframe.
    pub key0: u32,
    /// Index of the second keyframe. Equal to `key0` at clip boundaries or after snapping.
    pub key1: u32,
    /// Blend factor from `key0` towards `key1`, in `[0, 1]`.
    pub alpha: f32,
}

/// Calculates the number of samples present over `duration` at `sample_rate`.
pub fn calculate_num_samples(duration: f32, sample_rate: f32) -> u32 {
    debug_assert!(duration >= 0.0, "invalid duration: {}", duration);
    debug_assert!(sample_rate > 0.0, "invalid sample rate: {}", sample_rate);

    if duration == 0.0 {
        // No duration whatsoever, we have no samples.
        return 0;
    }

    if duration == f32::INFINITY {
        // An infinite duration is a single sample (static pose).
        return 1;
    }

    ((duration * sample_rate) + 0.5).floor() as u32 + 1
}

/// Calculates a clip duration from its number of samples and sample rate.
pub fn calculate_duration(num_samples: u32, sample_rate: f32) -> f32 {
    debug_assert!(sample_rate > 0.0, "invalid sample rate: {}", sample_rate);

    if num_samples == 0 {
        return 0.0;
    }

    if num_samples == 1 {
        // A single sample is a static pose with an indefinite duration.
        return f32::INFINITY;
    }

    (num_samples - 1) as f32 / sample_rate
}

/// Resolves the keyframe pair surrounding `sample_time` on the uniform grid, clamped into the
/// clip, with the requested rounding policy applied.
pub fn find_interpolation_keys(
    num_samples: u32,
    sample_rate: f32,
    sample_time: f32,
    policy: SampleRoundingPolicy,
) -> InterpolationKeys {
    debug_assert!(num_samples > 0, "cannot seek an empty clip");

    if num_samples == 1 {
        // Static pose, every sample time resolves to the one keyframe.
        return InterpolationKeys { key0: 0, key1: 0, alpha: 0.0 };
    }

    let duration = (num_samples - 1) as f32 / sample_rate;
    let clamped_time = sample_time.clamp(0.0, duration);

    let sample_offset = clamped_time * sample_rate;
    let key0 = (sample_offset.floor() as u32).min(num_samples - 1);
    let key1 = (key0 + 1).min(num_samples - 1);
    let alpha = if key1 == key0 { 0.0 } else { sample_offset - key0 as f32 };

    match policy {
        SampleRoundingPolicy::None => InterpolationKeys { key0, key1, alpha },
        SampleRoundingPolicy::Floor => InterpolationKeys { key0, key1, alpha: 0.0 },
        SampleRoundingPolicy::Ceil => InterpolationKeys { key0: key1, key1, alpha: 0.0 },
        SampleRoundingPolicy::Nearest => {
            if alpha >= 0.5 {
                InterpolationKeys { key0: key1, key1, alpha: 0.0 }
            }
            else {
                InterpolationKeys { key0, key1, alpha: 0.0 }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_num_samples_conventions() {
        assert_eq!(calculate_num_samples(0.0, 30.0), 0);
        assert_eq!(calculate_num_samples(f32::INFINITY, 30.0), 1);
        assert_eq!(calculate_num_samples(1.0 / 30.0, 30.0), 2);
        assert_eq!(calculate_num_samples(1.0, 30.0), 31);
    }

    #[test]
    fn verify_duration_conventions() {
        assert_eq!(calculate_duration(0, 30.0), 0.0);
        assert_eq!(calculate_duration(1, 30.0), f32::INFINITY);
        assert_eq!(calculate_duration(2, 30.0), 1.0 / 30.0);
        assert_eq!(calculate_duration(31, 30.0), 1.0);
    }

    #[test]
    fn verify_duration_round_trips_through_num_samples() {
        for num_samples in [2u32, 3, 16, 31, 120] {
            let duration = calculate_duration(num_samples, 30.0);
            assert_eq!(calculate_num_samples(duration, 30.0), num_samples);
        }
    }

    #[test]
    fn verify_interpolation_keys() {
        let keys = find_interpolation_keys(3, 30.0, 0.5 / 30.0, SampleRoundingPolicy::None);
        assert_eq!(keys.key0, 0);
        assert_eq!(keys.key1, 1);
        assert!((keys.alpha - 0.5).abs() < 1.0e-6);

        // Clamped past the end of the clip.
        let keys = find_interpolation_keys(3, 30.0, 10.0, SampleRoundingPolicy::None);
        assert_eq!(keys.key0, 2);
        assert_eq!(keys.key1, 2);
        assert_eq!(keys.alpha, 0.0);

        // Negative times clamp to the first sample.
        let keys = find_interpolation_keys(3, 30.0, -1.0, SampleRoundingPolicy::None);
        assert_eq!(keys.key0, 0);
        assert_eq!(keys.alpha, 0.0);
    }

    #[test]
    fn verify_rounding_policies() {
        let time = 0.7 / 30.0;

        let floor = find_interpolation_keys(4, 30.0, time, SampleRoundingPolicy::Floor);
        assert_eq!((floor.key0, floor.alpha), (0, 0.0));

        let ceil = find_interpolation_keys(4, 30.0, time, SampleRoundingPolicy::Ceil);
        assert_eq!((ceil.key0, ceil.key1, ceil.alpha), (1, 1, 0.0));

        let nearest = find_interpolation_keys(4, 30.0, time, SampleRoundingPolicy::Nearest);
        assert_eq!((nearest.key0, nearest.alpha), (1, 0.0));

        let nearest = find_interpolation_keys(4, 30.0, 0.3 / 30.0, SampleRoundingPolicy::Nearest);
        assert_eq!((nearest.key0, nearest.alpha), (0, 0.0));
    }

    #[test]
    fn verify_static_pose_seek() {
        for time in [0.0f32, 1.0, 1.0e6] {
            let keys = find_interpolation_keys(1, 30.0, time, SampleRoundingPolicy::None);
            assert_eq!((keys.key0, keys.key1, keys.alpha), (0, 0, 0.0));
        }
    }
}
