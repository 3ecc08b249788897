// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `range` module computes the min/extent ranges used to normalize samples before
//! quantization.

use choreia_core::math::{decay_scalar_unsigned, unpack_scalar_unsigned};

use glam::Vec4;

/// Range extents below this are treated as zero; the normalized value becomes 0 and the range
/// minimum carries the track.
pub(crate) const MIN_RANGE_EXTENT: f32 = 0.000000001;

/// A component-wise `(min, extent)` range over one track's samples.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct TrackRange {
    pub min: Vec4,
    pub extent: Vec4,
}

impl TrackRange {
    pub fn new(min: Vec4, max: Vec4) -> Self {
        TrackRange { min, extent: max - min }
    }

    /// Computes the component-wise bounds of the given samples.
    pub fn from_samples(samples: &[Vec4]) -> Self {
        debug_assert!(!samples.is_empty());

        let mut min = samples[0];
        let mut max = samples[0];

        for &sample in &samples[1..] {
            min = min.min(sample);
            max = max.max(sample);
        }

        TrackRange::new(min, max)
    }

    #[inline]
    pub fn max(&self) -> Vec4 {
        self.min + self.extent
    }
}

/// Normalizes a sample into `[0, 1]` against the given range. Components with a degenerate
/// extent normalize to 0.
#[inline]
pub(crate) fn normalize_vec4(sample: Vec4, range: &TrackRange) -> Vec4 {
    let normalized = (sample - range.min) / range.extent;

    Vec4::select(range.extent.cmplt(Vec4::splat(MIN_RANGE_EXTENT)), Vec4::ZERO, normalized)
}

/// Expands a normalized value back out of the given range.
#[inline]
pub(crate) fn expand_vec4(sample: Vec4, range: &TrackRange) -> Vec4 {
    sample * range.extent + range.min
}

/// Rounds a segment range to 8 bits per component, padded by one quantum on each side.
///
/// The runtime re-applies segment ranges at a fixed 8-bit precision, so the stored bounds must
/// already sit on the 8-bit grid and must enclose the true bounds: any 8-bit normalized value
/// then re-expands into the clip-level range.
pub(crate) fn fixup_segment_range(range: &TrackRange) -> TrackRange {
    let padding = Vec4::splat(unpack_scalar_unsigned(1, 8));

    let padded_min = (range.min - padding).max(Vec4::ZERO);
    let padded_max = (range.max() + padding).min(Vec4::ONE);

    let decay8 = |value: Vec4| -> Vec4 {
        Vec4::new(
            decay_scalar_unsigned(value.x, 8),
            decay_scalar_unsigned(value.y, 8),
            decay_scalar_unsigned(value.z, 8),
            decay_scalar_unsigned(value.w, 8),
        )
    };

    TrackRange::new(decay8(padded_min), decay8(padded_max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_range_from_samples() {
        let samples = [
            Vec4::new(1.0, -2.0, 0.5, 0.0),
            Vec4::new(-1.0, 4.0, 0.5, 0.0),
            Vec4::new(0.0, 1.0, 0.25, 0.0),
        ];

        let range = TrackRange::from_samples(&samples);
        assert_eq!(range.min, Vec4::new(-1.0, -2.0, 0.25, 0.0));
        assert_eq!(range.max(), Vec4::new(1.0, 4.0, 0.5, 0.0));
    }

    #[test]
    fn verify_normalize_expand_round_trip() {
        let samples = [Vec4::new(-5.0, 0.0, 2.0, 0.0), Vec4::new(5.0, 10.0, 4.0, 0.0)];
        let range = TrackRange::from_samples(&samples);

        for &sample in &samples {
            let normalized = normalize_vec4(sample, &range);
            assert!(normalized.min_element() >= 0.0 && normalized.max_element() <= 1.0);

            let expanded = expand_vec4(normalized, &range);
            assert!(expanded.abs_diff_eq(sample, 1.0e-4));
        }
    }

    #[test]
    fn verify_degenerate_extent_normalizes_to_zero() {
        let range = TrackRange::new(Vec4::splat(3.0), Vec4::splat(3.0));
        let normalized = normalize_vec4(Vec4::splat(3.0), &range);
        assert_eq!(normalized, Vec4::ZERO);

        // The minimum carries the value back.
        assert_eq!(expand_vec4(normalized, &range), Vec4::splat(3.0));
    }

    #[test]
    fn verify_segment_fixup_encloses_range() {
        let range = TrackRange::new(Vec4::splat(0.3), Vec4::splat(0.7));
        let fixed = fixup_segment_range(&range);

        // The rounded bounds must enclose the original bounds.
        assert!(fixed.min.x <= range.min.x);
        assert!(fixed.max().x >= range.max().x);

        // And must already sit on the 8-bit grid.
        let requantized_min = decay_scalar_unsigned(fixed.min.x, 8);
        assert_eq!(requantized_min, fixed.min.x);
        let requantized_max = decay_scalar_unsigned(fixed.max().x, 8);
        assert!((requantized_max - fixed.max().x).abs() < 1.0e-6);
    }

    #[test]
    fn verify_segment_fixup_clamps_to_unit_interval() {
        let range = TrackRange::new(Vec4::ZERO, Vec4::ONE);
        let fixed = fixup_segment_range(&range);
        assert_eq!(fixed.min, Vec4::ZERO);
        assert_eq!(fixed.max(), Vec4::ONE);
    }
}
