// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `bit_rate` module defines the variable bit rates a sub-track can be quantized at.

use once_cell::sync::Lazy;

/// Bits per component at each bit rate. Bit rate 0 is reserved for tracks that are constant
/// within a segment: a single sample is stored in the segment range slot instead of the
/// animated stream.
pub const BIT_RATE_NUM_BITS: [u8; 19] = [0, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 32];

/// Marks a sub-track that carries no variable bit rate (constant, default, or a full-precision
/// format).
pub const INVALID_BIT_RATE: u8 = 0xff;

pub const LOWEST_BIT_RATE: u8 = 1;
pub const HIGHEST_BIT_RATE: u8 = (BIT_RATE_NUM_BITS.len() - 1) as u8;
pub const NUM_BIT_RATES: u32 = BIT_RATE_NUM_BITS.len() as u32;

/// The constant-bit-rate sample is stored with this many bits per component in the segment
/// range slot it replaces (two 3-component 8-bit vectors).
pub const CONSTANT_BIT_RATE_NUM_BITS: u32 = 16;

#[inline]
pub fn num_bits_at_bit_rate(bit_rate: u8) -> u32 {
    debug_assert!(bit_rate <= HIGHEST_BIT_RATE, "invalid bit rate: {}", bit_rate);
    BIT_RATE_NUM_BITS[bit_rate as usize] as u32
}

/// The track is constant within the segment; its one sample lives in the range information.
#[inline]
pub fn is_constant_bit_rate(bit_rate: u8) -> bool {
    bit_rate == 0
}

/// The track stores raw full-precision components, skipping range reduction entirely.
#[inline]
pub fn is_raw_bit_rate(bit_rate: u8) -> bool {
    bit_rate == HIGHEST_BIT_RATE
}

/// The bit rates assigned to one bone's three channels.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BoneBitRates {
    pub rotation: u8,
    pub translation: u8,
    pub scale: u8,
}

impl BoneBitRates {
    pub const INVALID: BoneBitRates =
        BoneBitRates { rotation: INVALID_BIT_RATE, translation: INVALID_BIT_RATE, scale: INVALID_BIT_RATE };

    #[inline]
    pub fn is_fully_invalid(&self) -> bool {
        self.rotation == INVALID_BIT_RATE
            && self.translation == INVALID_BIT_RATE
            && self.scale == INVALID_BIT_RATE
    }
}

fn permutation_size(rates: &[u8]) -> u32 {
    rates.iter().map(|&rate| num_bits_at_bit_rate(rate)).sum()
}

/// Every (rotation, translation, scale) bit-rate triple, ordered from the smallest summed bit
/// count to the largest. The local-space search scans this table front to back so the first
/// triple under the error threshold is also the cheapest.
pub static LOCAL_BIT_RATE_PERMUTATIONS: Lazy<Vec<[u8; 3]>> = Lazy::new(|| {
    let mut permutations = Vec::with_capacity((NUM_BIT_RATES * NUM_BIT_RATES * NUM_BIT_RATES) as usize);

    for rotation in 0..NUM_BIT_RATES as u8 {
        for translation in 0..NUM_BIT_RATES as u8 {
            for scale in 0..NUM_BIT_RATES as u8 {
                permutations.push([rotation, translation, scale]);
            }
        }
    }

    permutations.sort_by_key(|rates| (permutation_size(rates), *rates));
    permutations
});

/// Same as [`LOCAL_BIT_RATE_PERMUTATIONS`] for clips without scale tracks.
pub static LOCAL_BIT_RATE_PERMUTATIONS_NO_SCALE: Lazy<Vec<[u8; 2]>> = Lazy::new(|| {
    let mut permutations = Vec::with_capacity((NUM_BIT_RATES * NUM_BIT_RATES) as usize);

    for rotation in 0..NUM_BIT_RATES as u8 {
        for translation in 0..NUM_BIT_RATES as u8 {
            permutations.push([rotation, translation]);
        }
    }

    permutations.sort_by_key(|rates| (permutation_size(rates), *rates));
    permutations
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_bit_rate_table() {
        assert_eq!(NUM_BIT_RATES, 19);
        assert_eq!(num_bits_at_bit_rate(0), 0);
        assert_eq!(num_bits_at_bit_rate(LOWEST_BIT_RATE), 3);
        assert_eq!(num_bits_at_bit_rate(HIGHEST_BIT_RATE), 32);

        assert!(is_constant_bit_rate(0));
        assert!(!is_constant_bit_rate(1));
        assert!(is_raw_bit_rate(HIGHEST_BIT_RATE));
    }

    #[test]
    fn verify_permutations_are_sorted_and_complete() {
        let permutations = &*LOCAL_BIT_RATE_PERMUTATIONS;
        assert_eq!(permutations.len(), 19 * 19 * 19);

        let mut prev_size = 0;
        for rates in permutations {
            let size = permutation_size(rates);
            assert!(size >= prev_size, "table must be ordered by summed bit count");
            prev_size = size;
        }

        let no_scale = &*LOCAL_BIT_RATE_PERMUTATIONS_NO_SCALE;
        assert_eq!(no_scale.len(), 19 * 19);
        assert_eq!(no_scale[0], [0, 0]);
    }
}
