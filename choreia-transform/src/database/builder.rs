// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `builder` module migrates keyframes out of compressed clips into a shared database.
//!
//! Interior frames (never the first or last of a segment) are ranked by their contributing
//! error and greedily assigned to the lowest importance tier first, then the medium tier; what
//! remains stays inline. Each streamable tier becomes a chunked bulk data region so the runtime
//! can page it in and out at chunk granularity. The source clips are rewritten: their animated
//! streams keep only the inline frames, they gain a database binding, and their
//! contributing-error metadata is stripped.

use choreia_core::bitset::bitset_test;
use choreia_core::buf::AlignedBuf;
use choreia_core::checksum::hash32;
use choreia_core::errors::{invalid_input_error, Result};
use choreia_core::io::copy_bits_ltr;

use crate::compression::writer::ByteWriter;
use crate::container::{
    align_to, database_flags, tracks_flags, ChunkDescription, ChunkHeader, ChunkSegmentHeader,
    CompressedDatabaseBuf, CompressedTracks, CompressedTracksBuf, DatabaseClipMetadata,
    DatabaseHeader, RawBufferHeader, SegmentHeader, TracksDatabaseHeader, TracksHeader,
    TransformTracksHeader, CHUNK_HEADER_SIZE, CHUNK_SEGMENT_HEADER_SIZE,
    COMPRESSED_DATABASE_TAG, COMPRESSED_DATABASE_VERSION_LATEST, DATABASE_HEADER_OFFSET,
    DATABASE_HEADER_SIZE, RAW_BUFFER_HEADER_SIZE, RUNTIME_CLIP_HEADER_SIZE,
    RUNTIME_SEGMENT_HEADER_SIZE, SEGMENT_HEADER_SIZE, SIMD_PADDING, TRACKS_DATABASE_HEADER_SIZE,
    TRANSFORM_HEADER_OFFSET, TRANSFORM_TRACKS_HEADER_SIZE,
};
use crate::settings::DatabaseSettings;

use log::debug;

/// One keyframe's identity during tier assignment.
#[derive(Copy, Clone, Debug)]
struct FrameTierMapping {
    clip_index: u32,
    segment_index: u32,
    segment_frame_index: u32,
}

/// The derived section sizes of a compressed clip, used to copy it piecewise.
pub(crate) struct ClipSections {
    pub bitset_bytes: usize,
    pub constant_data_size: usize,
    pub clip_range_data_size: usize,
    pub num_animated: usize,
    /// Per-segment range data size; 0 for single-segment clips.
    pub segment_range_data_size: usize,
}

pub(crate) fn clip_sections(tracks: &CompressedTracks<'_>) -> ClipSections {
    let num_sub_tracks = tracks.num_sub_tracks();
    let stride = tracks.num_sub_tracks_per_track();
    let default_bitset = tracks.default_bitset();
    let constant_bitset = tracks.constant_bitset();

    let rotation_components = tracks.rotation_format().num_components() as usize;
    let range_reduction = crate::settings::RangeReductionFlags::from_bits_truncate(
        tracks.header().range_reduction,
    );

    let channel_components =
        |channel: u32| if channel == 0 { rotation_components } else { 3 };
    let channel_flagged = |channel: u32| match channel {
        0 => range_reduction.contains(crate::settings::RangeReductionFlags::ROTATIONS),
        1 => range_reduction.contains(crate::settings::RangeReductionFlags::TRANSLATIONS),
        _ => range_reduction.contains(crate::settings::RangeReductionFlags::SCALES),
    };

    let mut constant_data_size = 0;
    let mut clip_range_data_size = 0;
    let mut num_animated = 0;
    let mut segment_range_data_size = 0;

    for sub_track_index in 0..num_sub_tracks {
        let channel = sub_track_index % stride;
        let is_default = bitset_test(&default_bitset, sub_track_index);
        let is_constant = bitset_test(&constant_bitset, sub_track_index);

        if is_constant {
            if !is_default {
                constant_data_size += channel_components(channel) * 4;
            }
            continue;
        }

        num_animated += 1;
        if channel_flagged(channel) {
            clip_range_data_size += 2 * channel_components(channel) * 4;
            segment_range_data_size += 2 * channel_components(channel);
        }
    }

    if tracks.num_segments() <= 1 {
        segment_range_data_size = 0;
    }

    ClipSections {
        bitset_bytes: (((num_sub_tracks + 31) / 32) * 4) as usize,
        constant_data_size,
        clip_range_data_size,
        num_animated,
        segment_range_data_size,
    }
}

/// Buffer position of a segment's inline animated stream.
pub(crate) fn segment_animated_data_position(
    tracks: &CompressedTracks<'_>,
    sections: &ClipSections,
    segment_index: u32,
) -> usize {
    let header = tracks.segment_header(segment_index);
    let mut position = tracks.anchored(header.segment_data_offset) + sections.num_animated;
    if sections.segment_range_data_size != 0 {
        position = align_to(position, 2) + sections.segment_range_data_size;
    }
    align_to(position, 4)
}

/// The greedy tier assignment state of one segment.
struct SegmentAssignment {
    /// `(segment_frame_index, contributing_error)` sorted by ascending error.
    errors: Vec<(u32, f32)>,
    num_movable: u32,
    num_assigned: u32,
}

/// Greedily pulls the `num_frames` globally cheapest unassigned movable frames into a tier,
/// then sorts the tier by (clip, segment, frame).
fn assign_frames_to_tier(
    assignments: &mut [Vec<SegmentAssignment>],
    num_frames: u32,
) -> Vec<FrameTierMapping> {
    let mut tier_frames = Vec::with_capacity(num_frames as usize);

    for _ in 0..num_frames {
        let mut best: Option<(f32, FrameTierMapping)> = None;

        for (clip_index, clip_segments) in assignments.iter().enumerate() {
            for (segment_index, segment) in clip_segments.iter().enumerate() {
                if segment.num_assigned >= segment.num_movable {
                    continue;
                }

                let (frame_index, error) = segment.errors[segment.num_assigned as usize];
                let is_better = match &best {
                    Some((best_error, _)) => error < *best_error,
                    None => true,
                };

                if is_better {
                    best = Some((
                        error,
                        FrameTierMapping {
                            clip_index: clip_index as u32,
                            segment_index: segment_index as u32,
                            segment_frame_index: frame_index,
                        },
                    ));
                }
            }
        }

        let (_, mapping) = best.expect("tier frame counts are clamped to the movable total");
        assignments[mapping.clip_index as usize][mapping.segment_index as usize].num_assigned += 1;
        tier_frames.push(mapping);
    }

    tier_frames.sort_by_key(|frame| (frame.clip_index, frame.segment_index, frame.segment_frame_index));
    tier_frames
}

/// Per-clip, per-segment frame masks of one tier.
fn tier_masks(tier_frames: &[FrameTierMapping], clips: &[CompressedTracks<'_>]) -> Vec<Vec<u32>> {
    let mut masks: Vec<Vec<u32>> =
        clips.iter().map(|clip| vec![0u32; clip.num_segments() as usize]).collect();

    for frame in tier_frames {
        masks[frame.clip_index as usize][frame.segment_index as usize] |=
            1 << frame.segment_frame_index;
    }

    masks
}

/// Rewrites a compressed clip for database use: inline frames only, a database binding, no
/// metadata.
pub(crate) fn rewrite_clip_for_database(
    tracks: &CompressedTracks<'_>,
    clip_index: u32,
    segment_base: u32,
    inline_masks: &[u32],
) -> CompressedTracksBuf {
    let sections = clip_sections(tracks);
    let source_header = tracks.header();
    let source_transform = tracks.transform_header();
    let num_segments = tracks.num_segments();

    // New layout, anchored at the transform tracks header.
    let mut offset = TRANSFORM_TRACKS_HEADER_SIZE;
    let mut transform_header = TransformTracksHeader { num_segments, ..bytemuck::Zeroable::zeroed() };

    if num_segments > 1 {
        offset = align_to(offset, 4);
        transform_header.segment_start_indices_offset = offset as u32;
        offset += 4 * (num_segments as usize + 1);
    }

    offset = align_to(offset, 4);
    transform_header.database_header_offset = offset as u32;
    offset += TRACKS_DATABASE_HEADER_SIZE;

    offset = align_to(offset, 4);
    transform_header.segment_headers_offset = offset as u32;
    offset += SEGMENT_HEADER_SIZE * num_segments as usize;

    offset = align_to(offset, 4);
    transform_header.default_bitset_offset = offset as u32;
    offset += sections.bitset_bytes;
    transform_header.constant_bitset_offset = offset as u32;
    offset += sections.bitset_bytes;

    if source_transform.output_indices_offset != 0 {
        offset = align_to(offset, 4);
        transform_header.output_indices_offset = offset as u32;
        offset += 4 * tracks.num_tracks() as usize;
    }

    offset = align_to(offset, 4);
    transform_header.constant_track_data_offset = offset as u32;
    offset += sections.constant_data_size;

    offset = align_to(offset, 4);
    transform_header.clip_range_data_offset = offset as u32;
    offset += sections.clip_range_data_size;

    transform_header.animated_group_types_offset = offset as u32;
    offset += sections.num_animated;

    // Per-segment data with only the inline frames.
    let mut segment_headers = Vec::with_capacity(num_segments as usize);
    for segment_index in 0..num_segments {
        let source_segment = tracks.segment_header(segment_index);
        let segment_data_offset = offset as u32;

        offset += sections.num_animated;
        if sections.segment_range_data_size != 0 {
            offset = align_to(offset, 2) + sections.segment_range_data_size;
        }
        offset = align_to(offset, 4);

        let inline_mask = inline_masks[segment_index as usize];
        let num_inline_frames = inline_mask.count_ones();
        let animated_bits =
            u64::from(num_inline_frames) * u64::from(source_segment.animated_pose_bit_size);
        offset += ((animated_bits + 7) / 8) as usize;

        segment_headers.push(SegmentHeader {
            animated_pose_bit_size: source_segment.animated_pose_bit_size,
            segment_data_offset,
            sample_indices: inline_mask,
        });
    }

    offset += SIMD_PADDING;

    let total_size = TRANSFORM_HEADER_OFFSET + offset;
    let mut buf = AlignedBuf::zeroed(total_size);

    {
        let mut writer = ByteWriter::new(&mut buf);

        writer.write_pod(&RawBufferHeader { size: total_size as u32, hash: 0 });

        let flags = (source_header.flags & !tracks_flags::HAS_METADATA) | tracks_flags::HAS_DATABASE;
        writer.write_pod(&TracksHeader { flags, ..source_header });

        writer.expect_position(TRANSFORM_HEADER_OFFSET);
        writer.write_pod(&transform_header);

        let anchored = |section_offset: u32| TRANSFORM_HEADER_OFFSET + section_offset as usize;
        let source_data = tracks.data();

        if transform_header.segment_start_indices_offset != 0 {
            writer.align(4);
            writer.expect_position(anchored(transform_header.segment_start_indices_offset));
            for segment_index in 0..=num_segments {
                writer.write_u32(tracks.segment_start_index(segment_index));
            }
        }

        writer.align(4);
        writer.expect_position(anchored(transform_header.database_header_offset));
        writer.write_pod(&TracksDatabaseHeader {
            clip_header_offset: clip_index * RUNTIME_CLIP_HEADER_SIZE,
            segment_headers_offset: segment_base * RUNTIME_SEGMENT_HEADER_SIZE,
        });

        writer.align(4);
        writer.expect_position(anchored(transform_header.segment_headers_offset));
        for segment_header in &segment_headers {
            writer.write_pod(segment_header);
        }

        // Bitsets, output indices, constant values, clip ranges, and group types are copied
        // verbatim; only their positions move.
        writer.align(4);
        writer.expect_position(anchored(transform_header.default_bitset_offset));
        let source_base = tracks.anchored(source_transform.default_bitset_offset);
        writer.write_bytes(&source_data[source_base..source_base + sections.bitset_bytes]);

        let source_base = tracks.anchored(source_transform.constant_bitset_offset);
        writer.write_bytes(&source_data[source_base..source_base + sections.bitset_bytes]);

        if transform_header.output_indices_offset != 0 {
            writer.align(4);
            writer.expect_position(anchored(transform_header.output_indices_offset));
            let source_base = tracks.anchored(source_transform.output_indices_offset);
            writer.write_bytes(
                &source_data[source_base..source_base + 4 * tracks.num_tracks() as usize],
            );
        }

        writer.align(4);
        writer.expect_position(anchored(transform_header.constant_track_data_offset));
        if sections.constant_data_size != 0 {
            let source_base = tracks.anchored(source_transform.constant_track_data_offset);
            writer.write_bytes(&source_data[source_base..source_base + sections.constant_data_size]);
        }

        writer.align(4);
        writer.expect_position(anchored(transform_header.clip_range_data_offset));
        if sections.clip_range_data_size != 0 {
            let source_base = tracks.anchored(source_transform.clip_range_data_offset);
            writer.write_bytes(&source_data[source_base..source_base + sections.clip_range_data_size]);
        }

        writer.expect_position(anchored(transform_header.animated_group_types_offset));
        if sections.num_animated != 0 {
            let source_base = tracks.anchored(source_transform.animated_group_types_offset);
            writer.write_bytes(&source_data[source_base..source_base + sections.num_animated]);
        }

        for segment_index in 0..num_segments {
            let source_segment = tracks.segment_header(segment_index);
            let new_segment = &segment_headers[segment_index as usize];

            writer.expect_position(anchored(new_segment.segment_data_offset));

            // Bit rates and segment range data are unchanged.
            let source_base = tracks.anchored(source_segment.segment_data_offset);
            writer.write_bytes(&source_data[source_base..source_base + sections.num_animated]);

            if sections.segment_range_data_size != 0 {
                writer.align(2);
                let source_base =
                    align_to(tracks.anchored(source_segment.segment_data_offset) + sections.num_animated, 2);
                writer.write_bytes(
                    &source_data[source_base..source_base + sections.segment_range_data_size],
                );
            }

            writer.align(4);

            // Repack the animated stream with only the inline frames, in frame order.
            let source_animated = segment_animated_data_position(tracks, &sections, segment_index);
            let pose_bit_size = u64::from(source_segment.animated_pose_bit_size);
            let inline_mask = new_segment.sample_indices;

            let num_inline_frames = inline_mask.count_ones();
            let animated_bits = u64::from(num_inline_frames) * pose_bit_size;
            let animated_bytes = ((animated_bits + 7) / 8) as usize;

            let mut frame_bits = vec![0u8; animated_bytes];
            let mut destination_bit = 0u64;
            for frame_index in 0..32u32 {
                if inline_mask & (1 << frame_index) == 0 {
                    continue;
                }

                copy_bits_ltr(
                    &mut frame_bits,
                    destination_bit,
                    source_data,
                    source_animated as u64 * 8 + u64::from(frame_index) * pose_bit_size,
                    pose_bit_size,
                );
                destination_bit += pose_bit_size;
            }

            writer.write_bytes(&frame_bits);
        }

        writer.skip_to(writer.position + SIMD_PADDING);
        writer.expect_position(total_size);
    }

    let content_hash = hash32(&buf[RAW_BUFFER_HEADER_SIZE..]);
    buf[4..8].copy_from_slice(&content_hash.to_le_bytes());

    CompressedTracksBuf::new_unchecked(buf)
}

/// One segment's contribution to a tier's bulk data during chunk packing.
pub(crate) struct TierSegment {
    pub clip_index: u32,
    /// Global runtime segment index.
    pub runtime_segment_index: u32,
    pub sample_indices: u32,
    /// The segment's frames, already packed back to back.
    pub data: Vec<u8>,
}

/// Packs a tier's segments into chunks and emits the bulk data region. Returns the chunk
/// descriptions (offsets within the region) and the region bytes.
pub(crate) fn build_bulk_data_region(
    tier_segments: &[TierSegment],
    clip_hashes: &[u32],
    max_chunk_size: u32,
    first_chunk_index: u32,
) -> (Vec<ChunkDescription>, Vec<u8>) {
    // Greedy packing: a segment is never split across chunks.
    let mut chunks: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_size = CHUNK_HEADER_SIZE;

    for (segment_index, segment) in tier_segments.iter().enumerate() {
        let added = CHUNK_SEGMENT_HEADER_SIZE + segment.data.len();
        if !current.is_empty()
            && current_size + added + SIMD_PADDING > max_chunk_size as usize
        {
            chunks.push(std::mem::take(&mut current));
            current_size = CHUNK_HEADER_SIZE;
        }

        current.push(segment_index);
        current_size += added;
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    // Emit the region.
    let mut descriptions = Vec::with_capacity(chunks.len());
    let mut region = Vec::new();

    for (chunk_offset_index, chunk_segments) in chunks.iter().enumerate() {
        let chunk_start = region.len();

        let headers_size = CHUNK_HEADER_SIZE + CHUNK_SEGMENT_HEADER_SIZE * chunk_segments.len();
        let data_size: usize =
            chunk_segments.iter().map(|&segment| tier_segments[segment].data.len()).sum();
        let chunk_size = headers_size + data_size;

        descriptions.push(ChunkDescription { offset: chunk_start as u32, size: chunk_size as u32 });

        region.extend_from_slice(bytemuck::bytes_of(&ChunkHeader {
            index: first_chunk_index + chunk_offset_index as u32,
            size: chunk_size as u32,
            num_segments: chunk_segments.len() as u32,
        }));

        let mut samples_offset = chunk_start + headers_size;
        for &segment in chunk_segments {
            let tier_segment = &tier_segments[segment];
            region.extend_from_slice(bytemuck::bytes_of(&ChunkSegmentHeader {
                clip_hash: clip_hashes[tier_segment.clip_index as usize],
                sample_indices: tier_segment.sample_indices,
                samples_offset: samples_offset as u32,
                clip_header_offset: tier_segment.clip_index * RUNTIME_CLIP_HEADER_SIZE,
                segment_header_offset: tier_segment.runtime_segment_index * RUNTIME_SEGMENT_HEADER_SIZE,
            }));
            samples_offset += tier_segment.data.len();
        }

        for &segment in chunk_segments {
            region.extend_from_slice(&tier_segments[segment].data);
        }
    }

    if !region.is_empty() {
        // Wide unaligned loads may run past the last frame of the last chunk.
        region.extend_from_slice(&[0u8; SIMD_PADDING]);
    }

    (descriptions, region)
}

/// Assembles the final database buffer from its parts.
pub(crate) fn write_database(
    settings_max_chunk_size: u32,
    num_clips: u32,
    num_segments: u32,
    chunk_descriptions: [&[ChunkDescription]; 2],
    clip_metadata: &[DatabaseClipMetadata],
    bulk_regions: [&[u8]; 2],
) -> CompressedDatabaseBuf {
    let total_chunks = chunk_descriptions[0].len() + chunk_descriptions[1].len();

    let mut offset = DATABASE_HEADER_SIZE;

    offset = align_to(offset, 4);
    let chunk_descriptions_offset = offset as u32;
    offset += total_chunks * std::mem::size_of::<ChunkDescription>();

    let clip_metadata_offset = offset as u32;
    offset += clip_metadata.len() * std::mem::size_of::<DatabaseClipMetadata>();

    let mut bulk_data_offset = [0u32; 2];
    let mut bulk_data_size = [0u32; 2];
    let mut bulk_data_hash = [0u32; 2];
    for tier_index in 0..2 {
        if !bulk_regions[tier_index].is_empty() {
            offset = align_to(offset, 8);
            bulk_data_offset[tier_index] = offset as u32;
            bulk_data_size[tier_index] = bulk_regions[tier_index].len() as u32;
            bulk_data_hash[tier_index] = hash32(bulk_regions[tier_index]);
            offset += bulk_regions[tier_index].len();
        }
    }

    let total_size = DATABASE_HEADER_OFFSET + offset;
    let mut buf = AlignedBuf::zeroed(total_size);

    {
        let mut writer = ByteWriter::new(&mut buf);

        writer.write_pod(&RawBufferHeader { size: total_size as u32, hash: 0 });

        writer.write_pod(&DatabaseHeader {
            tag: COMPRESSED_DATABASE_TAG,
            version: COMPRESSED_DATABASE_VERSION_LATEST,
            flags: database_flags::BULK_DATA_INLINE,
            num_chunks: [chunk_descriptions[0].len() as u32, chunk_descriptions[1].len() as u32],
            max_chunk_size: settings_max_chunk_size,
            num_clips,
            num_segments,
            chunk_descriptions_offset,
            clip_metadata_offset,
            bulk_data_offset,
            bulk_data_size,
            bulk_data_hash,
        });

        let anchored = |section_offset: u32| DATABASE_HEADER_OFFSET + section_offset as usize;

        writer.align(4);
        writer.expect_position(anchored(chunk_descriptions_offset));
        for tier_index in 0..2 {
            for description in chunk_descriptions[tier_index] {
                writer.write_pod(description);
            }
        }

        writer.expect_position(anchored(clip_metadata_offset));
        for metadata in clip_metadata {
            writer.write_pod(metadata);
        }

        for tier_index in 0..2 {
            if !bulk_regions[tier_index].is_empty() {
                writer.align(8);
                writer.expect_position(anchored(bulk_data_offset[tier_index]));
                writer.write_bytes(bulk_regions[tier_index]);
            }
        }

        writer.expect_position(total_size);
    }

    let content_hash = hash32(&buf[RAW_BUFFER_HEADER_SIZE..]);
    buf[4..8].copy_from_slice(&content_hash.to_le_bytes());

    CompressedDatabaseBuf::new_unchecked(buf)
}

/// Extracts one segment's tier frames from its original (pre-rewrite) animated stream.
fn extract_tier_segment_data(
    tracks: &CompressedTracks<'_>,
    sections: &ClipSections,
    segment_index: u32,
    tier_mask: u32,
) -> Vec<u8> {
    let source_animated = segment_animated_data_position(tracks, sections, segment_index);
    let pose_bit_size = u64::from(tracks.segment_header(segment_index).animated_pose_bit_size);

    let num_frames = tier_mask.count_ones();
    let total_bits = u64::from(num_frames) * pose_bit_size;
    let mut data = vec![0u8; ((total_bits + 7) / 8) as usize];

    let mut destination_bit = 0u64;
    for frame_index in 0..32u32 {
        if tier_mask & (1 << frame_index) == 0 {
            continue;
        }

        copy_bits_ltr(
            &mut data,
            destination_bit,
            tracks.data(),
            source_animated as u64 * 8 + u64::from(frame_index) * pose_bit_size,
            pose_bit_size,
        );
        destination_bit += pose_bit_size;
    }

    data
}

/// Builds a streaming database from compressed clips carrying contributing-error metadata.
///
/// Returns the rewritten clips (now bound to the database, metadata stripped) and the database
/// with its bulk data inline.
pub fn build_database(
    settings: &DatabaseSettings,
    tracks_list: &[CompressedTracksBuf],
) -> Result<(Vec<CompressedTracksBuf>, CompressedDatabaseBuf)> {
    settings.is_valid()?;

    if tracks_list.is_empty() {
        return invalid_input_error("a database needs at least one clip");
    }

    let clips: Vec<CompressedTracks<'_>> = tracks_list.iter().map(|tracks| tracks.view()).collect();

    for clip in &clips {
        if clip.is_bound_to_database() {
            return invalid_input_error("clip is already bound to a database");
        }
        if !clip.has_metadata() {
            return invalid_input_error("clip carries no contributing error metadata");
        }
    }

    // Rank every movable frame.
    let mut assignments: Vec<Vec<SegmentAssignment>> = clips
        .iter()
        .map(|clip| {
            (0..clip.num_segments())
                .map(|segment_index| {
                    let num_frames = clip.segment_num_samples(segment_index);
                    SegmentAssignment {
                        errors: clip.contributing_errors(segment_index),
                        num_movable: if num_frames >= 2 { num_frames - 2 } else { 0 },
                        num_assigned: 0,
                    }
                })
                .collect()
        })
        .collect();

    let num_movable: u32 = assignments
        .iter()
        .flat_map(|clip_segments| clip_segments.iter().map(|segment| segment.num_movable))
        .sum();

    // Tier frame counts by proportion, clamped to the movable total. The lowest importance
    // tier is assigned first: it takes the globally cheapest frames.
    let num_low = (num_movable as f32 * settings.low_importance_tier_proportion) as u32;
    let num_medium = ((num_movable as f32 * settings.medium_importance_tier_proportion) as u32)
        .min(num_movable - num_low);

    let low_frames = assign_frames_to_tier(&mut assignments, num_low);
    let medium_frames = assign_frames_to_tier(&mut assignments, num_medium);

    let low_masks = tier_masks(&low_frames, &clips);
    let medium_masks = tier_masks(&medium_frames, &clips);

    // Whatever was not pulled into a streamable tier stays inline, anchors included.
    let mut segment_bases = Vec::with_capacity(clips.len());
    let mut num_segments_total = 0u32;
    for clip in &clips {
        segment_bases.push(num_segments_total);
        num_segments_total += clip.num_segments();
    }

    let mut rewritten = Vec::with_capacity(clips.len());
    for (clip_index, clip) in clips.iter().enumerate() {
        let inline_masks: Vec<u32> = (0..clip.num_segments())
            .map(|segment_index| {
                let num_frames = clip.segment_num_samples(segment_index);
                let all_frames =
                    if num_frames >= 32 { u32::MAX } else { (1u32 << num_frames) - 1 };
                all_frames
                    & !medium_masks[clip_index][segment_index as usize]
                    & !low_masks[clip_index][segment_index as usize]
            })
            .collect();

        rewritten.push(rewrite_clip_for_database(
            clip,
            clip_index as u32,
            segment_bases[clip_index],
            &inline_masks,
        ));
    }

    let rewritten_hashes: Vec<u32> =
        rewritten.iter().map(|tracks| tracks.view().hash()).collect();

    // Extract the streamable frames from the ORIGINAL clips (their animated streams still hold
    // every frame) and pack them into chunks.
    let mut tier_regions = Vec::with_capacity(2);
    let mut tier_descriptions = Vec::with_capacity(2);
    let mut first_chunk_index = 0u32;

    for tier_mask_set in [&medium_masks, &low_masks] {
        let mut tier_segments = Vec::new();

        for (clip_index, clip) in clips.iter().enumerate() {
            let sections = clip_sections(clip);
            for segment_index in 0..clip.num_segments() {
                let mask = tier_mask_set[clip_index][segment_index as usize];
                if mask == 0 {
                    continue;
                }

                tier_segments.push(TierSegment {
                    clip_index: clip_index as u32,
                    runtime_segment_index: segment_bases[clip_index] + segment_index,
                    sample_indices: mask,
                    data: extract_tier_segment_data(clip, &sections, segment_index, mask),
                });
            }
        }

        let (descriptions, region) = build_bulk_data_region(
            &tier_segments,
            &rewritten_hashes,
            settings.max_chunk_size,
            first_chunk_index,
        );
        first_chunk_index += descriptions.len() as u32;

        tier_descriptions.push(descriptions);
        tier_regions.push(region);
    }

    let clip_metadata: Vec<DatabaseClipMetadata> = rewritten_hashes
        .iter()
        .enumerate()
        .map(|(clip_index, &clip_hash)| DatabaseClipMetadata {
            clip_hash,
            clip_header_offset: clip_index as u32 * RUNTIME_CLIP_HEADER_SIZE,
        })
        .collect();

    let database = write_database(
        settings.max_chunk_size,
        clips.len() as u32,
        num_segments_total,
        [&tier_descriptions[0], &tier_descriptions[1]],
        &clip_metadata,
        [&tier_regions[0], &tier_regions[1]],
    );

    debug!(
        "built database: {} clips, {} segments, {} movable frames ({} medium, {} low)",
        clips.len(),
        num_segments_total,
        num_movable,
        num_medium,
        num_low
    );

    Ok((rewritten, database))
}
