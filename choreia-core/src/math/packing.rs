// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use glam::Vec3;

/// Quantizes a normalized value in `[0, 1]` onto `num_bits` bits with symmetric rounding.
#[inline]
pub fn pack_scalar_unsigned(input: f32, num_bits: u32) -> u32 {
    debug_assert!(num_bits >= 1 && num_bits < 31, "invalid bit count: {}", num_bits);
    debug_assert!((0.0..=1.0).contains(&input), "expected normalized input: {}", input);

    let max_value = (1u32 << num_bits) - 1;
    let packed = (input * max_value as f32).round() as u32;

    // Inputs sit within [0, 1] but rounding at the upper edge can overshoot by one quantum.
    packed.min(max_value)
}

/// Expands a `num_bits`-bit quantized value back into `[0, 1]`.
#[inline]
pub fn unpack_scalar_unsigned(input: u32, num_bits: u32) -> f32 {
    debug_assert!(num_bits >= 1 && num_bits < 31, "invalid bit count: {}", num_bits);

    let max_value = (1u32 << num_bits) - 1;
    debug_assert!(input <= max_value, "input value too large: {}", input);

    // Unpacking is faster when multiplying with the reciprocal.
    let inv_max_value = 1.0 / max_value as f32;
    input as f32 * inv_max_value
}

/// Quantizes then dequantizes a normalized value, yielding the value the decompressor will see.
#[inline]
pub fn decay_scalar_unsigned(input: f32, num_bits: u32) -> f32 {
    unpack_scalar_unsigned(pack_scalar_unsigned(input, num_bits), num_bits)
}

/// Quantizes then dequantizes each component of a normalized vector.
#[inline]
pub fn decay_vec3_unsigned(input: Vec3, num_bits: u32) -> Vec3 {
    Vec3::new(
        decay_scalar_unsigned(input.x, num_bits),
        decay_scalar_unsigned(input.y, num_bits),
        decay_scalar_unsigned(input.z, num_bits),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_scalar_round_trip_exact_at_edges() {
        for num_bits in [1u32, 3, 8, 16, 19, 23] {
            assert_eq!(pack_scalar_unsigned(0.0, num_bits), 0);
            assert_eq!(unpack_scalar_unsigned(0, num_bits), 0.0);

            let max_value = (1u32 << num_bits) - 1;
            assert_eq!(pack_scalar_unsigned(1.0, num_bits), max_value);
            assert_eq!(unpack_scalar_unsigned(max_value, num_bits), 1.0);
        }
    }

    #[test]
    fn verify_decay_error_bound() {
        // The worst-case decay error is half a quantum.
        for num_bits in [3u32, 8, 16] {
            let quantum = 1.0 / ((1u32 << num_bits) - 1) as f32;
            for step in 0..=100 {
                let value = step as f32 / 100.0;
                let decayed = decay_scalar_unsigned(value, num_bits);
                assert!((decayed - value).abs() <= quantum * 0.5 + 1.0e-6);
            }
        }
    }

    #[test]
    fn verify_decay_is_idempotent() {
        for step in 0..=50 {
            let value = step as f32 / 50.0;
            let once = decay_scalar_unsigned(value, 8);
            let twice = decay_scalar_unsigned(once, 8);
            assert_eq!(once, twice);
        }
    }
}
