// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `ops` module reshapes built databases: splitting bulk data out for streaming, stripping
//! a quality tier, and merging databases together.

use choreia_core::buf::AlignedBuf;
use choreia_core::checksum::hash32;
use choreia_core::errors::{buffer_error, invalid_input_error, BufferErrorKind, Result};

use crate::container::{
    align_to, database_flags, parse_chunk, ChunkDescription, CompressedDatabase,
    CompressedDatabaseBuf, CompressedTracksBuf, DatabaseClipMetadata, DatabaseHeader,
    DATABASE_HEADER_OFFSET, DATABASE_HEADER_SIZE, RAW_BUFFER_HEADER_SIZE,
    RUNTIME_SEGMENT_HEADER_SIZE,
};
use crate::database::builder::{build_bulk_data_region, write_database, TierSegment};
use crate::settings::{DatabaseSettings, DatabaseTier};

/// Recomputes and patches a buffer's content hash after an in-place edit.
fn rehash_buffer(bytes: &mut [u8]) {
    let content_hash = hash32(&bytes[RAW_BUFFER_HEADER_SIZE..]);
    bytes[4..8].copy_from_slice(&content_hash.to_le_bytes());
}

fn patch_database_header(bytes: &mut [u8], header: &DatabaseHeader) {
    bytes[DATABASE_HEADER_OFFSET..DATABASE_HEADER_OFFSET + DATABASE_HEADER_SIZE]
        .copy_from_slice(bytemuck::bytes_of(header));
}

/// Separates a database from its bulk data so the bulk can live on slower storage and stream
/// in on demand. The returned database carries only offsets; the two blobs hold the medium and
/// low importance tiers.
pub fn split_compressed_database_bulk_data(
    database: &CompressedDatabase<'_>,
) -> Result<(CompressedDatabaseBuf, AlignedBuf, AlignedBuf)> {
    if !database.is_bulk_data_inline() {
        return invalid_input_error("bulk data is not inline in source database");
    }

    let bulk_medium =
        AlignedBuf::from_slice(database.bulk_data(0).unwrap_or(&[]));
    let bulk_low = AlignedBuf::from_slice(database.bulk_data(1).unwrap_or(&[]));

    let mut header = database.header();

    // The buffer now ends where the first bulk region used to start.
    let split_size = header.bulk_data_offset.iter().copied().filter(|&offset| offset != 0).min();
    let new_size = match split_size {
        Some(offset) => DATABASE_HEADER_OFFSET + offset as usize,
        None => database.size() as usize,
    };

    header.flags &= !database_flags::BULK_DATA_INLINE;
    header.bulk_data_offset = [0, 0];

    let mut buf = AlignedBuf::from_slice(&database.data()[..new_size]);
    buf[0..4].copy_from_slice(&(new_size as u32).to_le_bytes());
    patch_database_header(&mut buf, &header);
    rehash_buffer(&mut buf);

    Ok((CompressedDatabaseBuf::new_unchecked(buf), bulk_medium, bulk_low))
}

/// Reinlines previously split bulk data, restoring the database byte-for-byte.
pub fn join_compressed_database_bulk_data(
    database: &CompressedDatabase<'_>,
    bulk_medium: &[u8],
    bulk_low: &[u8],
) -> Result<CompressedDatabaseBuf> {
    if database.is_bulk_data_inline() {
        return invalid_input_error("bulk data is already inline");
    }

    let mut header = database.header();

    let regions = [bulk_medium, bulk_low];
    for tier_index in 0..2 {
        if regions[tier_index].len() as u32 != header.bulk_data_size[tier_index] {
            return invalid_input_error("bulk data size does not match the database");
        }
        if !regions[tier_index].is_empty()
            && hash32(regions[tier_index]) != header.bulk_data_hash[tier_index]
        {
            return buffer_error(BufferErrorKind::InvalidHash);
        }
    }

    let mut offset = database.size() as usize - DATABASE_HEADER_OFFSET;
    let mut bulk_data_offset = [0u32; 2];
    for tier_index in 0..2 {
        if !regions[tier_index].is_empty() {
            offset = align_to(offset, 8);
            bulk_data_offset[tier_index] = offset as u32;
            offset += regions[tier_index].len();
        }
    }

    let total_size = DATABASE_HEADER_OFFSET + offset;

    header.flags |= database_flags::BULK_DATA_INLINE;
    header.bulk_data_offset = bulk_data_offset;

    let mut buf = AlignedBuf::zeroed(total_size);
    buf[..database.size() as usize].copy_from_slice(database.data());
    buf[0..4].copy_from_slice(&(total_size as u32).to_le_bytes());
    patch_database_header(&mut buf, &header);

    for tier_index in 0..2 {
        if !regions[tier_index].is_empty() {
            let base = DATABASE_HEADER_OFFSET + bulk_data_offset[tier_index] as usize;
            buf[base..base + regions[tier_index].len()].copy_from_slice(regions[tier_index]);
        }
    }

    rehash_buffer(&mut buf);
    Ok(CompressedDatabaseBuf::new_unchecked(buf))
}

/// Produces a database with one quality tier's bulk data removed. The stripped tier's chunk
/// descriptions are zeroed; stripping the two streamable tiers in either order yields the same
/// bytes.
pub fn strip_quality_tier(
    database: &CompressedDatabase<'_>,
    tier: DatabaseTier,
) -> Result<CompressedDatabaseBuf> {
    if !database.is_bulk_data_inline() {
        return invalid_input_error("bulk data is not inline in source database");
    }

    let tier_index = tier.streaming_index();
    let mut header = database.header();

    // Keep the other tier's region, repositioned after the headers.
    let other_index = 1 - tier_index;
    let other_region = database.bulk_data(other_index).map(|region| region.to_vec());

    let mut offset = {
        // The headers end where the first region used to begin, or at the buffer end.
        let first_region = header.bulk_data_offset.iter().copied().filter(|&o| o != 0).min();
        match first_region {
            Some(region_offset) => region_offset as usize,
            None => database.size() as usize - DATABASE_HEADER_OFFSET,
        }
    };

    let mut bulk_data_offset = [0u32; 2];
    let mut bulk_data_size = [0u32; 2];
    let mut bulk_data_hash = [0u32; 2];

    if let Some(region) = &other_region {
        offset = align_to(offset, 8);
        bulk_data_offset[other_index] = offset as u32;
        bulk_data_size[other_index] = region.len() as u32;
        bulk_data_hash[other_index] = header.bulk_data_hash[other_index];
        offset += region.len();
    }

    let headers_end = {
        let first_region = header.bulk_data_offset.iter().copied().filter(|&o| o != 0).min();
        match first_region {
            Some(region_offset) => DATABASE_HEADER_OFFSET + region_offset as usize,
            None => database.size() as usize,
        }
    };

    let total_size = DATABASE_HEADER_OFFSET + offset;

    header.bulk_data_offset = bulk_data_offset;
    header.bulk_data_size = bulk_data_size;
    header.bulk_data_hash = bulk_data_hash;

    let mut buf = AlignedBuf::zeroed(total_size);
    buf[..headers_end].copy_from_slice(&database.data()[..headers_end]);
    buf[0..4].copy_from_slice(&(total_size as u32).to_le_bytes());
    patch_database_header(&mut buf, &header);

    // Zero the stripped tier's chunk descriptions.
    let num_stripped_chunks = database.num_chunks(tier_index);
    for chunk_index in 0..num_stripped_chunks {
        let global_index =
            if tier_index == 0 { chunk_index } else { database.num_chunks(0) + chunk_index };
        let base = DATABASE_HEADER_OFFSET
            + database.header().chunk_descriptions_offset as usize
            + global_index as usize * std::mem::size_of::<ChunkDescription>();
        buf[base..base + std::mem::size_of::<ChunkDescription>()].fill(0);
    }

    if let Some(region) = &other_region {
        let base = DATABASE_HEADER_OFFSET + bulk_data_offset[other_index] as usize;
        buf[base..base + region.len()].copy_from_slice(region);
    }

    rehash_buffer(&mut buf);
    Ok(CompressedDatabaseBuf::new_unchecked(buf))
}

/// One input pair of a database merge. The compressed tracks buffer is rewritten in place to
/// point at its slot in the merged runtime header layout.
pub struct DatabaseMergeMapping<'a> {
    pub tracks: &'a mut CompressedTracksBuf,
    pub database: &'a CompressedDatabaseBuf,
}

/// Merges databases into one, rebasing every clip onto the merged runtime header layout.
///
/// Each input database must hold exactly one clip, carry its bulk data inline, and share the
/// merge settings' chunk size. Chunks are repacked with the same greedy packing the builder
/// uses, so merging databases built with identical settings reproduces the database that a
/// combined build would have produced.
pub fn merge_compressed_databases(
    settings: &DatabaseSettings,
    mappings: &mut [DatabaseMergeMapping<'_>],
) -> Result<CompressedDatabaseBuf> {
    settings.is_valid()?;

    if mappings.is_empty() {
        return invalid_input_error("nothing to merge");
    }

    for mapping in mappings.iter() {
        let database = mapping.database.view();
        if !database.is_bulk_data_inline() {
            return invalid_input_error("compressed database does not have inline bulk data");
        }
        if database.max_chunk_size() != settings.max_chunk_size {
            return invalid_input_error("databases must share the merge chunk size");
        }
        if database.num_clips() != 1 {
            return invalid_input_error("merge inputs must hold exactly one clip each");
        }

        let tracks = mapping.tracks.view();
        if !tracks.is_bound_to_database()
            || database.clip_metadata(0).clip_hash != tracks.hash()
        {
            return invalid_input_error("compressed tracks are not bound to their database");
        }
    }

    // Assign merged runtime slots in mapping order and rebase each clip onto them.
    let mut segment_bases = Vec::with_capacity(mappings.len());
    let mut num_segments_total = 0u32;
    for mapping in mappings.iter() {
        segment_bases.push(num_segments_total);
        num_segments_total += mapping.database.view().num_segments();
    }

    for (clip_index, mapping) in mappings.iter_mut().enumerate() {
        let database_header_offset = {
            let tracks = mapping.tracks.view();
            tracks.anchored(tracks.transform_header().database_header_offset)
        };

        let bytes = mapping.tracks.as_bytes_mut();
        let clip_header_offset = clip_index as u32 * crate::container::RUNTIME_CLIP_HEADER_SIZE;
        let segment_headers_offset = segment_bases[clip_index] * RUNTIME_SEGMENT_HEADER_SIZE;
        bytes[database_header_offset..database_header_offset + 4]
            .copy_from_slice(&clip_header_offset.to_le_bytes());
        bytes[database_header_offset + 4..database_header_offset + 8]
            .copy_from_slice(&segment_headers_offset.to_le_bytes());
        rehash_buffer(bytes);
    }

    let merged_hashes: Vec<u32> =
        mappings.iter().map(|mapping| mapping.tracks.view().hash()).collect();

    // Gather every streamed segment in merged order and repack the chunks.
    let mut tier_regions = Vec::with_capacity(2);
    let mut tier_descriptions = Vec::with_capacity(2);
    let mut first_chunk_index = 0u32;

    for tier_index in 0..2 {
        let mut tier_segments = Vec::new();

        for (clip_index, mapping) in mappings.iter().enumerate() {
            let database = mapping.database.view();
            let tracks = mapping.tracks.view();
            let Some(bulk_data) = database.bulk_data(tier_index) else { continue };

            for chunk_index in 0..database.num_chunks(tier_index) {
                let description = database.chunk_description(tier_index, chunk_index);
                if description.size == 0 {
                    continue;
                }

                let (_, records) = parse_chunk(bulk_data, description.offset);
                for record in &records {
                    let local_segment_index =
                        record.segment_header_offset / RUNTIME_SEGMENT_HEADER_SIZE;

                    let pose_bit_size = tracks
                        .segment_header(local_segment_index)
                        .animated_pose_bit_size;
                    let num_frames = record.sample_indices.count_ones();
                    let data_size =
                        ((u64::from(num_frames) * u64::from(pose_bit_size) + 7) / 8) as usize;

                    let start = record.samples_offset as usize;
                    tier_segments.push(TierSegment {
                        clip_index: clip_index as u32,
                        runtime_segment_index: segment_bases[clip_index] + local_segment_index,
                        sample_indices: record.sample_indices,
                        data: bulk_data[start..start + data_size].to_vec(),
                    });
                }
            }
        }

        let (descriptions, region) = build_bulk_data_region(
            &tier_segments,
            &merged_hashes,
            settings.max_chunk_size,
            first_chunk_index,
        );
        first_chunk_index += descriptions.len() as u32;

        tier_descriptions.push(descriptions);
        tier_regions.push(region);
    }

    let clip_metadata: Vec<DatabaseClipMetadata> = merged_hashes
        .iter()
        .enumerate()
        .map(|(clip_index, &clip_hash)| DatabaseClipMetadata {
            clip_hash,
            clip_header_offset: clip_index as u32 * crate::container::RUNTIME_CLIP_HEADER_SIZE,
        })
        .collect();

    Ok(write_database(
        settings.max_chunk_size,
        mappings.len() as u32,
        num_segments_total,
        [&tier_descriptions[0], &tier_descriptions[1]],
        &clip_metadata,
        [&tier_regions[0], &tier_regions[1]],
    ))
}
