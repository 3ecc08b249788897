// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Skeletal transform track compression.
//!
//! This crate implements a lossy codec for time-sampled skeletal animation: for every bone of a
//! rigged character, rotation/translation/scale keyframes are resampled onto a uniform grid,
//! range-reduced, and quantized with an error-driven variable bit rate chosen per bone over the
//! skeleton hierarchy. The output is a single bit-packed buffer that can be randomly sampled in
//! microseconds, and a subset of its keyframes can be moved into a streamable database so the
//! least important data pages in and out at runtime.

pub mod bit_rate;
pub mod compression;
pub mod container;
pub mod database;
pub mod decompression;
pub mod error_metric;
pub mod settings;
pub mod tracks;

pub use compression::{compress_track_list, CompressionStats};
pub use container::{CompressedDatabase, CompressedDatabaseBuf, CompressedTracks, CompressedTracksBuf};
pub use database::{
    build_database, join_compressed_database_bulk_data, merge_compressed_databases,
    split_compressed_database_bulk_data, strip_quality_tier, DatabaseContext,
    DatabaseMergeMapping, DatabaseStreamer, DatabaseTier, DebugStreamer, StreamRequestResult,
};
pub use decompression::{DecompressionContext, PoseWriter};
pub use error_metric::{QvvTransformErrorMetric, TransformErrorMetric};
pub use settings::{CompressionLevel, CompressionSettings, DatabaseSettings, RotationFormat, VectorFormat};
pub use tracks::{Bone, RawTrackList, Skeleton, TransformTrack};
