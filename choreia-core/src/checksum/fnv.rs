// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

const FNV1A_32_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV1A_32_PRIME: u32 = 16_777_619;

const FNV1A_64_OFFSET_BASIS: u64 = 14_695_981_039_346_656_037;
const FNV1A_64_PRIME: u64 = 1_099_511_628_211;

/// A streaming 32-bit FNV-1a hasher.
///
/// FNV-1a is not cryptographic. It is used to sanity check compressed buffers against accidental
/// corruption and to fingerprint settings, where speed and stability across platforms matter and
/// adversarial inputs do not.
#[derive(Copy, Clone, Debug)]
pub struct Fnv1a32 {
    state: u32,
}

impl Fnv1a32 {
    pub fn new() -> Self {
        Fnv1a32 { state: FNV1A_32_OFFSET_BASIS }
    }

    /// Processes the given bytes, updating the hash state.
    pub fn update(&mut self, data: &[u8]) {
        let mut acc = self.state;
        for &byte in data {
            acc = (acc ^ u32::from(byte)).wrapping_mul(FNV1A_32_PRIME);
        }
        self.state = acc;
    }

    /// Returns the hash of all bytes processed so far.
    pub fn digest(&self) -> u32 {
        self.state
    }
}

impl Default for Fnv1a32 {
    fn default() -> Self {
        Fnv1a32::new()
    }
}

/// A streaming 64-bit FNV-1a hasher.
#[derive(Copy, Clone, Debug)]
pub struct Fnv1a64 {
    state: u64,
}

impl Fnv1a64 {
    pub fn new() -> Self {
        Fnv1a64 { state: FNV1A_64_OFFSET_BASIS }
    }

    /// Processes the given bytes, updating the hash state.
    pub fn update(&mut self, data: &[u8]) {
        let mut acc = self.state;
        for &byte in data {
            acc = (acc ^ u64::from(byte)).wrapping_mul(FNV1A_64_PRIME);
        }
        self.state = acc;
    }

    /// Returns the hash of all bytes processed so far.
    pub fn digest(&self) -> u64 {
        self.state
    }
}

impl Default for Fnv1a64 {
    fn default() -> Self {
        Fnv1a64::new()
    }
}

/// Hashes a byte buffer with 32-bit FNV-1a in one shot.
pub fn hash32(data: &[u8]) -> u32 {
    let mut hasher = Fnv1a32::new();
    hasher.update(data);
    hasher.digest()
}

/// Hashes a byte buffer with 64-bit FNV-1a in one shot.
pub fn hash64(data: &[u8]) -> u64 {
    let mut hasher = Fnv1a64::new();
    hasher.update(data);
    hasher.digest()
}

/// Combines two 32-bit hashes into one.
#[inline]
pub fn hash_combine32(hash_a: u32, hash_b: u32) -> u32 {
    (hash_a ^ hash_b).wrapping_mul(FNV1A_32_PRIME)
}

/// Combines two 64-bit hashes into one.
#[inline]
pub fn hash_combine64(hash_a: u64, hash_b: u64) -> u64 {
    (hash_a ^ hash_b).wrapping_mul(FNV1A_64_PRIME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_fnv1a_32() {
        assert_eq!(hash32(b""), 0x811c_9dc5);
        assert_eq!(hash32(b"a"), 0xe40c_292c);
        assert_eq!(hash32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn verify_fnv1a_64() {
        assert_eq!(hash64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(hash64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(hash64(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn verify_streaming_matches_one_shot() {
        let mut hasher = Fnv1a32::new();
        hasher.update(b"foo");
        hasher.update(b"bar");
        assert_eq!(hasher.digest(), hash32(b"foobar"));
    }

    #[test]
    fn verify_combine_is_order_sensitive() {
        let a = hash32(b"left");
        let b = hash32(b"right");
        assert_ne!(hash_combine32(a, b), hash_combine32(b, a));
    }
}
