// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `container` module defines the compressed binary formats and the borrowed views used to
//! read them.
//!
//! A compressed artefact is one contiguous buffer that can be written to disk, memory mapped,
//! or copied between address spaces: it never stores pointers, only `u32` byte offsets from the
//! header that owns them. Integers are little-endian, floats IEEE-754 32-bit. Every byte after
//! the raw buffer header is covered by a 32-bit FNV-1a hash recorded in that header.

mod database;
mod tracks;

pub use database::{CompressedDatabase, CompressedDatabaseBuf};
pub use tracks::{CompressedTracks, CompressedTracksBuf};

pub(crate) use database::parse_chunk;

use bytemuck::{Pod, Zeroable};

/// Identifies a compressed transform tracks buffer.
pub const COMPRESSED_TRACKS_TAG: u32 = u32::from_le_bytes(*b"CHTK");
/// Identifies a compressed database buffer.
pub const COMPRESSED_DATABASE_TAG: u32 = u32::from_le_bytes(*b"CHDB");

pub const COMPRESSED_TRACKS_VERSION_FIRST: u16 = 1;
pub const COMPRESSED_TRACKS_VERSION_LATEST: u16 = 1;
pub const COMPRESSED_DATABASE_VERSION_FIRST: u16 = 1;
pub const COMPRESSED_DATABASE_VERSION_LATEST: u16 = 1;

/// The decompressor performs unaligned 16-byte wide loads at arbitrary frame boundaries; the
/// last animated payload of a buffer is followed by this much padding to keep them in bounds.
pub const SIMD_PADDING: usize = 15;

/// Prefix of every compressed buffer. NOT covered by the hash it records.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct RawBufferHeader {
    /// Total buffer size in bytes, including this header.
    pub size: u32,
    /// FNV-1a 32 over every byte after this header.
    pub hash: u32,
}

pub(crate) const RAW_BUFFER_HEADER_SIZE: usize = 8;

pub(crate) mod tracks_flags {
    pub const HAS_SCALE: u16 = 0x0001;
    pub const HAS_DATABASE: u16 = 0x0002;
    pub const HAS_METADATA: u16 = 0x0004;
    pub const HAS_OUTPUT_REMAP: u16 = 0x0008;
}

/// Fixed-size clip description. Hashed, and the anchor of nothing: offsets live in
/// [`TransformTracksHeader`].
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct TracksHeader {
    pub tag: u32,
    pub version: u16,
    pub flags: u16,
    pub num_tracks: u32,
    pub num_samples: u32,
    pub sample_rate: f32,
    pub rotation_format: u8,
    pub translation_format: u8,
    pub scale_format: u8,
    pub range_reduction: u8,
}

pub(crate) const TRACKS_HEADER_SIZE: usize = 24;

/// Offsets of every per-clip section. All offsets are byte offsets from the start of this
/// header; 0 marks an absent optional section.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct TransformTracksHeader {
    pub num_segments: u32,
    /// `u32[num_segments + 1]`, the last entry holding the clip sample count. Present only
    /// with more than one segment.
    pub segment_start_indices_offset: u32,
    /// [`TracksDatabaseHeader`], present only when bound to a database.
    pub database_header_offset: u32,
    /// `[SegmentHeader; num_segments]`.
    pub segment_headers_offset: u32,
    pub default_bitset_offset: u32,
    pub constant_bitset_offset: u32,
    /// `u32[num_tracks]`, present only when some track's output index differs from its index.
    pub output_indices_offset: u32,
    pub constant_track_data_offset: u32,
    pub clip_range_data_offset: u32,
    pub animated_group_types_offset: u32,
}

pub(crate) const TRANSFORM_TRACKS_HEADER_SIZE: usize = 40;

/// Where the transform tracks header (the offset anchor) sits inside a tracks buffer.
pub(crate) const TRANSFORM_HEADER_OFFSET: usize = RAW_BUFFER_HEADER_SIZE + TRACKS_HEADER_SIZE;

#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct SegmentHeader {
    /// Bits consumed by one keyframe of this segment's animated streams.
    pub animated_pose_bit_size: u32,
    /// Offset of this segment's data block, from the transform tracks header.
    pub segment_data_offset: u32,
    /// Bitmask of the segment's frames stored inline in this buffer. Without a database every
    /// frame is inline.
    pub sample_indices: u32,
}

pub(crate) const SEGMENT_HEADER_SIZE: usize = 12;

/// Links a clip to its slots inside a database's runtime headers.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct TracksDatabaseHeader {
    /// Byte offset of this clip's runtime clip header within the database runtime data.
    pub clip_header_offset: u32,
    /// Byte offset of this clip's first runtime segment header.
    pub segment_headers_offset: u32,
}

pub(crate) const TRACKS_DATABASE_HEADER_SIZE: usize = 8;

pub(crate) mod database_flags {
    pub const BULK_DATA_INLINE: u16 = 0x0001;
}

/// Fixed-size database description and the anchor of every offset it carries.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct DatabaseHeader {
    pub tag: u32,
    pub version: u16,
    pub flags: u16,
    /// Chunk counts per streamable tier: `[medium, low]`.
    pub num_chunks: [u32; 2],
    pub max_chunk_size: u32,
    pub num_clips: u32,
    pub num_segments: u32,
    /// `[ChunkDescription]` for both tiers, medium tier first.
    pub chunk_descriptions_offset: u32,
    /// `[DatabaseClipMetadata; num_clips]`.
    pub clip_metadata_offset: u32,
    /// Per-tier bulk data regions; 0 when split out or stripped.
    pub bulk_data_offset: [u32; 2],
    pub bulk_data_size: [u32; 2],
    pub bulk_data_hash: [u32; 2],
}

pub(crate) const DATABASE_HEADER_SIZE: usize = 60;

/// Where the database header (the offset anchor) sits inside a database buffer.
pub(crate) const DATABASE_HEADER_OFFSET: usize = RAW_BUFFER_HEADER_SIZE;

/// Locates one chunk within its tier's bulk data region. A zeroed description marks a chunk
/// whose tier was stripped.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct ChunkDescription {
    pub offset: u32,
    pub size: u32,
}

pub(crate) const CHUNK_DESCRIPTION_SIZE: usize = 8;

#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct DatabaseClipMetadata {
    pub clip_hash: u32,
    pub clip_header_offset: u32,
}

pub(crate) const DATABASE_CLIP_METADATA_SIZE: usize = 8;

/// Prefix of every chunk inside a bulk data region.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct ChunkHeader {
    pub index: u32,
    pub size: u32,
    pub num_segments: u32,
}

pub(crate) const CHUNK_HEADER_SIZE: usize = 12;

/// Per-segment record inside a chunk.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct ChunkSegmentHeader {
    /// Hash of the compressed tracks buffer this segment belongs to.
    pub clip_hash: u32,
    /// Bitmask of the segment frames this chunk carries.
    pub sample_indices: u32,
    /// Byte offset of this segment's frames, absolute within the tier's bulk data region.
    pub samples_offset: u32,
    pub clip_header_offset: u32,
    pub segment_header_offset: u32,
}

pub(crate) const CHUNK_SEGMENT_HEADER_SIZE: usize = 20;

/// Size of one runtime clip header owned by a database context.
pub(crate) const RUNTIME_CLIP_HEADER_SIZE: u32 = 8;
/// Size of one runtime segment header owned by a database context.
pub(crate) const RUNTIME_SEGMENT_HEADER_SIZE: u32 = 16;

/// Reads a little-endian `u32` at the given byte offset.
#[inline]
pub(crate) fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

/// Reads a little-endian `f32` at the given byte offset.
#[inline]
pub(crate) fn read_f32(data: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

/// Rounds `offset` up to the given power-of-two alignment.
#[inline]
pub(crate) fn align_to(offset: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (offset + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_header_sizes() {
        use std::mem::size_of;

        assert_eq!(size_of::<RawBufferHeader>(), RAW_BUFFER_HEADER_SIZE);
        assert_eq!(size_of::<TracksHeader>(), TRACKS_HEADER_SIZE);
        assert_eq!(size_of::<TransformTracksHeader>(), TRANSFORM_TRACKS_HEADER_SIZE);
        assert_eq!(size_of::<SegmentHeader>(), SEGMENT_HEADER_SIZE);
        assert_eq!(size_of::<TracksDatabaseHeader>(), TRACKS_DATABASE_HEADER_SIZE);
        assert_eq!(size_of::<DatabaseHeader>(), DATABASE_HEADER_SIZE);
        assert_eq!(size_of::<ChunkDescription>(), CHUNK_DESCRIPTION_SIZE);
        assert_eq!(size_of::<DatabaseClipMetadata>(), DATABASE_CLIP_METADATA_SIZE);
        assert_eq!(size_of::<ChunkHeader>(), CHUNK_HEADER_SIZE);
        assert_eq!(size_of::<ChunkSegmentHeader>(), CHUNK_SEGMENT_HEADER_SIZE);
    }

    #[test]
    fn verify_align_to() {
        assert_eq!(align_to(0, 4), 0);
        assert_eq!(align_to(1, 4), 4);
        assert_eq!(align_to(4, 4), 4);
        assert_eq!(align_to(5, 2), 6);
        assert_eq!(align_to(17, 16), 32);
    }
}
