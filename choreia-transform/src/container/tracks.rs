// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use choreia_core::buf::{AlignedBuf, BUFFER_ALIGNMENT};
use choreia_core::checksum::hash32;
use choreia_core::errors::{buffer_error, BufferErrorKind, Result};
use choreia_core::units::calculate_duration;

use crate::container::{
    read_u32, tracks_flags, RawBufferHeader, SegmentHeader, TracksDatabaseHeader, TracksHeader,
    TransformTracksHeader, COMPRESSED_TRACKS_TAG, COMPRESSED_TRACKS_VERSION_FIRST,
    COMPRESSED_TRACKS_VERSION_LATEST, RAW_BUFFER_HEADER_SIZE, SEGMENT_HEADER_SIZE,
    TRANSFORM_HEADER_OFFSET,
};
use crate::settings::{RotationFormat, VectorFormat};

/// A borrowed, validated view over a compressed transform tracks buffer.
#[derive(Copy, Clone)]
pub struct CompressedTracks<'a> {
    data: &'a [u8],
}

impl<'a> CompressedTracks<'a> {
    /// Binds a buffer, validating alignment, size, tag, and version. The hash is not checked;
    /// call [`CompressedTracks::validate_hash`] for that.
    pub fn bound(data: &'a [u8]) -> Result<Self> {
        if data.as_ptr() as usize % BUFFER_ALIGNMENT != 0 {
            return buffer_error(BufferErrorKind::InvalidAlignment);
        }

        if data.len() < TRANSFORM_HEADER_OFFSET {
            return buffer_error(BufferErrorKind::InvalidTag);
        }

        let tracks = CompressedTracks { data };
        let header = tracks.header();

        if header.tag != COMPRESSED_TRACKS_TAG {
            return buffer_error(BufferErrorKind::InvalidTag);
        }

        if header.version < COMPRESSED_TRACKS_VERSION_FIRST
            || header.version > COMPRESSED_TRACKS_VERSION_LATEST
        {
            return buffer_error(BufferErrorKind::InvalidVersion);
        }

        if (tracks.size() as usize) > data.len() {
            return buffer_error(BufferErrorKind::InvalidTag);
        }

        Ok(tracks)
    }

    /// Wraps a buffer this crate just produced, skipping validation.
    pub(crate) fn new_unchecked(data: &'a [u8]) -> Self {
        CompressedTracks { data }
    }

    #[inline]
    pub(crate) fn data(&self) -> &'a [u8] {
        self.data
    }

    fn raw_buffer_header(&self) -> RawBufferHeader {
        bytemuck::pod_read_unaligned(&self.data[0..RAW_BUFFER_HEADER_SIZE])
    }

    pub(crate) fn header(&self) -> TracksHeader {
        bytemuck::pod_read_unaligned(&self.data[RAW_BUFFER_HEADER_SIZE..TRANSFORM_HEADER_OFFSET])
    }

    pub(crate) fn transform_header(&self) -> TransformTracksHeader {
        bytemuck::pod_read_unaligned(
            &self.data[TRANSFORM_HEADER_OFFSET
                ..TRANSFORM_HEADER_OFFSET + std::mem::size_of::<TransformTracksHeader>()],
        )
    }

    /// The buffer size recorded in the header, in bytes.
    #[inline]
    pub fn size(&self) -> u32 {
        self.raw_buffer_header().size
    }

    /// The content hash recorded in the header.
    #[inline]
    pub fn hash(&self) -> u32 {
        self.raw_buffer_header().hash
    }

    /// Recomputes the hash over every byte after the raw buffer header.
    pub fn compute_hash(&self) -> u32 {
        hash32(&self.data[RAW_BUFFER_HEADER_SIZE..self.size() as usize])
    }

    /// Recomputes the content hash and compares it against the recorded one.
    pub fn validate_hash(&self) -> Result<()> {
        if self.compute_hash() != self.hash() {
            return buffer_error(BufferErrorKind::InvalidHash);
        }
        Ok(())
    }

    #[inline]
    pub fn num_tracks(&self) -> u32 {
        self.header().num_tracks
    }

    #[inline]
    pub fn num_samples(&self) -> u32 {
        self.header().num_samples
    }

    #[inline]
    pub fn sample_rate(&self) -> f32 {
        self.header().sample_rate
    }

    /// The clip duration in seconds; infinite for single-sample clips (static pose).
    #[inline]
    pub fn duration(&self) -> f32 {
        calculate_duration(self.num_samples(), self.sample_rate())
    }

    #[inline]
    pub fn has_scale(&self) -> bool {
        self.header().flags & tracks_flags::HAS_SCALE != 0
    }

    #[inline]
    pub fn is_bound_to_database(&self) -> bool {
        self.header().flags & tracks_flags::HAS_DATABASE != 0
    }

    #[inline]
    pub fn has_metadata(&self) -> bool {
        self.header().flags & tracks_flags::HAS_METADATA != 0
    }

    #[inline]
    pub fn num_segments(&self) -> u32 {
        self.transform_header().num_segments
    }

    /// Sub-tracks per bone: rotation and translation, plus scale when the clip carries any.
    #[inline]
    pub fn num_sub_tracks_per_track(&self) -> u32 {
        if self.has_scale() {
            3
        }
        else {
            2
        }
    }

    #[inline]
    pub fn num_sub_tracks(&self) -> u32 {
        self.num_tracks() * self.num_sub_tracks_per_track()
    }

    pub(crate) fn rotation_format(&self) -> RotationFormat {
        RotationFormat::from_u8(self.header().rotation_format).expect("validated on bind")
    }

    pub(crate) fn translation_format(&self) -> VectorFormat {
        VectorFormat::from_u8(self.header().translation_format).expect("validated on bind")
    }

    pub(crate) fn scale_format(&self) -> VectorFormat {
        VectorFormat::from_u8(self.header().scale_format).expect("validated on bind")
    }

    /// Resolves an offset anchored at the transform tracks header into a buffer position.
    #[inline]
    pub(crate) fn anchored(&self, offset: u32) -> usize {
        debug_assert!(offset != 0, "resolving an absent section");
        TRANSFORM_HEADER_OFFSET + offset as usize
    }

    /// The first clip sample index of the given segment.
    pub(crate) fn segment_start_index(&self, segment_index: u32) -> u32 {
        let transform_header = self.transform_header();
        debug_assert!(segment_index <= transform_header.num_segments);

        if transform_header.num_segments <= 1 {
            return if segment_index == 0 { 0 } else { self.num_samples() };
        }

        let base = self.anchored(transform_header.segment_start_indices_offset);
        read_u32(self.data, base + segment_index as usize * 4)
    }

    /// The number of samples within the given segment.
    pub(crate) fn segment_num_samples(&self, segment_index: u32) -> u32 {
        self.segment_start_index(segment_index + 1) - self.segment_start_index(segment_index)
    }

    /// Finds the segment containing the given clip sample via binary search over the start
    /// indices.
    pub(crate) fn segment_containing(&self, clip_sample_index: u32) -> u32 {
        let num_segments = self.num_segments();
        if num_segments <= 1 {
            return 0;
        }

        let mut low = 0u32;
        let mut high = num_segments - 1;
        while low < high {
            let mid = (low + high + 1) / 2;
            if self.segment_start_index(mid) <= clip_sample_index {
                low = mid;
            }
            else {
                high = mid - 1;
            }
        }
        low
    }

    pub(crate) fn segment_header(&self, segment_index: u32) -> SegmentHeader {
        let transform_header = self.transform_header();
        debug_assert!(segment_index < transform_header.num_segments);

        let base = self.anchored(transform_header.segment_headers_offset)
            + segment_index as usize * SEGMENT_HEADER_SIZE;
        bytemuck::pod_read_unaligned(&self.data[base..base + SEGMENT_HEADER_SIZE])
    }

    pub(crate) fn database_header(&self) -> Option<TracksDatabaseHeader> {
        let transform_header = self.transform_header();
        if transform_header.database_header_offset == 0 {
            return None;
        }

        let base = self.anchored(transform_header.database_header_offset);
        Some(bytemuck::pod_read_unaligned(
            &self.data[base..base + std::mem::size_of::<TracksDatabaseHeader>()],
        ))
    }

    /// Reads a bitset section into words.
    pub(crate) fn read_bitset(&self, section_offset: u32) -> Vec<u32> {
        let num_words = (self.num_sub_tracks() + 31) / 32;
        let base = self.anchored(section_offset);

        (0..num_words as usize).map(|word| read_u32(self.data, base + word * 4)).collect()
    }

    pub(crate) fn default_bitset(&self) -> Vec<u32> {
        self.read_bitset(self.transform_header().default_bitset_offset)
    }

    pub(crate) fn constant_bitset(&self) -> Vec<u32> {
        self.read_bitset(self.transform_header().constant_bitset_offset)
    }

    /// The output index of each track, identity when no remap section is present.
    pub(crate) fn output_index(&self, track_index: u32) -> u32 {
        let transform_header = self.transform_header();
        if transform_header.output_indices_offset == 0 {
            return track_index;
        }

        let base = self.anchored(transform_header.output_indices_offset);
        read_u32(self.data, base + track_index as usize * 4)
    }

    /// Byte offset (anchored) of the contributing error metadata, if present. The offset itself
    /// is recorded in the last four bytes of the buffer.
    pub(crate) fn contributing_error_offset(&self) -> Option<u32> {
        if !self.has_metadata() {
            return None;
        }

        let size = self.size() as usize;
        Some(read_u32(self.data, size - 4))
    }

    /// The per-frame contributing error entries of one segment, sorted by ascending error:
    /// `(segment_frame_index, error)` pairs.
    pub(crate) fn contributing_errors(&self, segment_index: u32) -> Vec<(u32, f32)> {
        let metadata_offset =
            self.contributing_error_offset().expect("clip carries no contributing error metadata");

        // Entries are laid out per segment in order; skip the preceding segments' frames.
        let mut entry_index = 0;
        for preceding in 0..segment_index {
            entry_index += self.segment_num_samples(preceding);
        }

        let num_frames = self.segment_num_samples(segment_index);
        let base = self.anchored(metadata_offset) + entry_index as usize * 8;

        (0..num_frames as usize)
            .map(|frame| {
                let frame_index = read_u32(self.data, base + frame * 8);
                let error = super::read_f32(self.data, base + frame * 8 + 4);
                (frame_index, error)
            })
            .collect()
    }
}

/// An owning compressed transform tracks buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressedTracksBuf {
    buf: AlignedBuf,
}

impl CompressedTracksBuf {
    /// Takes ownership of a buffer, validating it first.
    pub fn bound(buf: AlignedBuf) -> Result<Self> {
        CompressedTracks::bound(&buf)?;
        Ok(CompressedTracksBuf { buf })
    }

    pub(crate) fn new_unchecked(buf: AlignedBuf) -> Self {
        CompressedTracksBuf { buf }
    }

    pub fn view(&self) -> CompressedTracks<'_> {
        CompressedTracks::new_unchecked(&self.buf)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn into_inner(self) -> AlignedBuf {
        self.buf
    }
}
