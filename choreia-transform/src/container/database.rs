// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use choreia_core::buf::{AlignedBuf, BUFFER_ALIGNMENT};
use choreia_core::checksum::hash32;
use choreia_core::errors::{buffer_error, BufferErrorKind, Result};

use crate::container::{
    database_flags, ChunkDescription, ChunkHeader, ChunkSegmentHeader, DatabaseClipMetadata,
    DatabaseHeader, RawBufferHeader, CHUNK_DESCRIPTION_SIZE, CHUNK_HEADER_SIZE,
    CHUNK_SEGMENT_HEADER_SIZE, COMPRESSED_DATABASE_TAG, COMPRESSED_DATABASE_VERSION_FIRST,
    COMPRESSED_DATABASE_VERSION_LATEST, DATABASE_CLIP_METADATA_SIZE, DATABASE_HEADER_OFFSET,
    DATABASE_HEADER_SIZE, RAW_BUFFER_HEADER_SIZE,
};

/// A borrowed, validated view over a compressed database buffer.
#[derive(Copy, Clone)]
pub struct CompressedDatabase<'a> {
    data: &'a [u8],
}

impl<'a> CompressedDatabase<'a> {
    /// Binds a buffer, validating alignment, size, tag, and version. The hash is not checked;
    /// call [`CompressedDatabase::validate_hash`] for that.
    pub fn bound(data: &'a [u8]) -> Result<Self> {
        if data.as_ptr() as usize % BUFFER_ALIGNMENT != 0 {
            return buffer_error(BufferErrorKind::InvalidAlignment);
        }

        if data.len() < DATABASE_HEADER_OFFSET + DATABASE_HEADER_SIZE {
            return buffer_error(BufferErrorKind::InvalidTag);
        }

        let database = CompressedDatabase { data };
        let header = database.header();

        if header.tag != COMPRESSED_DATABASE_TAG {
            return buffer_error(BufferErrorKind::InvalidTag);
        }

        if header.version < COMPRESSED_DATABASE_VERSION_FIRST
            || header.version > COMPRESSED_DATABASE_VERSION_LATEST
        {
            return buffer_error(BufferErrorKind::InvalidVersion);
        }

        if (database.size() as usize) > data.len() {
            return buffer_error(BufferErrorKind::InvalidTag);
        }

        Ok(database)
    }

    pub(crate) fn new_unchecked(data: &'a [u8]) -> Self {
        CompressedDatabase { data }
    }

    #[inline]
    pub(crate) fn data(&self) -> &'a [u8] {
        self.data
    }

    fn raw_buffer_header(&self) -> RawBufferHeader {
        bytemuck::pod_read_unaligned(&self.data[0..RAW_BUFFER_HEADER_SIZE])
    }

    pub(crate) fn header(&self) -> DatabaseHeader {
        bytemuck::pod_read_unaligned(
            &self.data[DATABASE_HEADER_OFFSET..DATABASE_HEADER_OFFSET + DATABASE_HEADER_SIZE],
        )
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.raw_buffer_header().size
    }

    #[inline]
    pub fn hash(&self) -> u32 {
        self.raw_buffer_header().hash
    }

    pub fn compute_hash(&self) -> u32 {
        hash32(&self.data[RAW_BUFFER_HEADER_SIZE..self.size() as usize])
    }

    pub fn validate_hash(&self) -> Result<()> {
        if self.compute_hash() != self.hash() {
            return buffer_error(BufferErrorKind::InvalidHash);
        }
        Ok(())
    }

    /// Total size including bulk data that was split out of this buffer.
    pub fn total_size(&self) -> u32 {
        let header = self.header();
        if self.is_bulk_data_inline() {
            self.size()
        }
        else {
            self.size() + header.bulk_data_size[0] + header.bulk_data_size[1]
        }
    }

    #[inline]
    pub fn is_bulk_data_inline(&self) -> bool {
        self.header().flags & database_flags::BULK_DATA_INLINE != 0
    }

    #[inline]
    pub fn num_clips(&self) -> u32 {
        self.header().num_clips
    }

    #[inline]
    pub fn num_segments(&self) -> u32 {
        self.header().num_segments
    }

    #[inline]
    pub fn max_chunk_size(&self) -> u32 {
        self.header().max_chunk_size
    }

    /// Chunk count of one streamable tier (0 = medium importance, 1 = low importance).
    #[inline]
    pub fn num_chunks(&self, tier_index: usize) -> u32 {
        self.header().num_chunks[tier_index]
    }

    #[inline]
    pub fn total_num_chunks(&self) -> u32 {
        let header = self.header();
        header.num_chunks[0] + header.num_chunks[1]
    }

    /// Resolves an offset anchored at the database header into a buffer position.
    #[inline]
    pub(crate) fn anchored(&self, offset: u32) -> usize {
        debug_assert!(offset != 0, "resolving an absent section");
        DATABASE_HEADER_OFFSET + offset as usize
    }

    /// Reads one chunk description. Chunk indices are global: the medium tier's chunks come
    /// first.
    pub(crate) fn chunk_description(&self, tier_index: usize, chunk_index: u32) -> ChunkDescription {
        let header = self.header();
        debug_assert!(chunk_index < header.num_chunks[tier_index]);

        let global_index = if tier_index == 0 { chunk_index } else { header.num_chunks[0] + chunk_index };
        let base = self.anchored(header.chunk_descriptions_offset)
            + global_index as usize * CHUNK_DESCRIPTION_SIZE;
        bytemuck::pod_read_unaligned(&self.data[base..base + CHUNK_DESCRIPTION_SIZE])
    }

    pub(crate) fn clip_metadata(&self, clip_index: u32) -> DatabaseClipMetadata {
        let header = self.header();
        debug_assert!(clip_index < header.num_clips);

        let base = self.anchored(header.clip_metadata_offset)
            + clip_index as usize * DATABASE_CLIP_METADATA_SIZE;
        bytemuck::pod_read_unaligned(&self.data[base..base + DATABASE_CLIP_METADATA_SIZE])
    }

    /// The inline bulk data region of one tier (0 = medium importance, 1 = low importance),
    /// when present.
    pub fn bulk_data(&self, tier_index: usize) -> Option<&'a [u8]> {
        let header = self.header();
        if !self.is_bulk_data_inline() || header.bulk_data_offset[tier_index] == 0 {
            return None;
        }

        let base = self.anchored(header.bulk_data_offset[tier_index]);
        Some(&self.data[base..base + header.bulk_data_size[tier_index] as usize])
    }
}

/// Parses the chunk header and per-segment records at `chunk_offset` within a bulk data region.
pub(crate) fn parse_chunk(
    bulk_data: &[u8],
    chunk_offset: u32,
) -> (ChunkHeader, Vec<ChunkSegmentHeader>) {
    let base = chunk_offset as usize;
    let header: ChunkHeader =
        bytemuck::pod_read_unaligned(&bulk_data[base..base + CHUNK_HEADER_SIZE]);

    let mut segments = Vec::with_capacity(header.num_segments as usize);
    let mut offset = base + CHUNK_HEADER_SIZE;
    for _ in 0..header.num_segments {
        segments.push(bytemuck::pod_read_unaligned::<ChunkSegmentHeader>(
            &bulk_data[offset..offset + CHUNK_SEGMENT_HEADER_SIZE],
        ));
        offset += CHUNK_SEGMENT_HEADER_SIZE;
    }

    (header, segments)
}

/// An owning compressed database buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressedDatabaseBuf {
    buf: AlignedBuf,
}

impl CompressedDatabaseBuf {
    /// Takes ownership of a buffer, validating it first.
    pub fn bound(buf: AlignedBuf) -> Result<Self> {
        CompressedDatabase::bound(&buf)?;
        Ok(CompressedDatabaseBuf { buf })
    }

    pub(crate) fn new_unchecked(buf: AlignedBuf) -> Self {
        CompressedDatabaseBuf { buf }
    }

    pub fn view(&self) -> CompressedDatabase<'_> {
        CompressedDatabase::new_unchecked(&self.buf)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> AlignedBuf {
        self.buf
    }
}
