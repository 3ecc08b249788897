// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `math` module provides the transform type and the quantization primitives shared by the
//! compressor and the decompressor.
//!
//! Both sides of the codec must agree bit-for-bit: the compressor's error measurements decode
//! trial samples through the exact same pack/unpack functions the decompressor uses at runtime.

mod packing;
mod quat;
mod qvv;

pub use packing::{
    decay_scalar_unsigned, decay_vec3_unsigned, pack_scalar_unsigned, unpack_scalar_unsigned,
};
pub use quat::{quat_ensure_positive_w, quat_from_positive_w, quat_nlerp, vec4_to_quat};
pub use qvv::Qvv;
