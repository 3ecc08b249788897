// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `checksum` module provides the hashing algorithms used to fingerprint compressed buffers
//! and settings.

mod fnv;

pub use fnv::{hash32, hash64, hash_combine32, hash_combine64, Fnv1a32, Fnv1a64};
