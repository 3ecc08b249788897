// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `database` module implements the streaming keyframe database.
//!
//! A database carries the medium and low importance keyframes of one or more compressed clips
//! out-of-band, in chunked bulk data that pages in and out at runtime. The high importance
//! frames, including the immovable first and last frame of every segment, always stay inline
//! in the clips themselves, so a clip bound to a database remains playable at reduced fidelity
//! with nothing streamed in at all.

pub(crate) mod builder;
mod context;
mod ops;
mod streamer;

pub use builder::build_database;
pub use context::{DatabaseContext, StreamRequestResult};
pub use ops::{
    join_compressed_database_bulk_data, merge_compressed_databases,
    split_compressed_database_bulk_data, strip_quality_tier, DatabaseMergeMapping,
};
pub use streamer::{DatabaseStreamer, DebugStreamer, StreamInContinuation, StreamOutContinuation};

pub use crate::settings::DatabaseTier;
