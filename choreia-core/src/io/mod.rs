// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `io` module implements the bit-level I/O primitives of the compressed containers.
//!
//! Animated pose streams are bit-packed with no byte alignment between sub-tracks or frames.
//! Bits are laid out left-to-right: the most-significant bit of a value is written first. This
//! ordering lets the decompressor extract any field with one wide load, one left shift to drop
//! the leading bits, and one right shift to isolate the field.

mod bit;

pub use bit::{copy_bits_ltr, read_bits_ltr, BitWriterLtr};
