// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `context` module holds the runtime state of a bound database.
//!
//! A database context owns the per-segment runtime headers the decompressor reads: for every
//! segment, one `AtomicU64` slot per streamable tier packing `(samples_offset << 32) |
//! sample_indices`. Streaming completions publish into these slots with relaxed ordering; a
//! reader either sees a tier fully published or not at all, and never a torn pair. Relaxed is
//! sufficient because the bulk data pointer itself is owned by the streamer and stable between
//! allocation events.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use choreia_core::errors::{invalid_input_error, Result};

use crate::container::{
    parse_chunk, ChunkDescription, ChunkSegmentHeader, CompressedDatabase, CompressedTracks,
    RUNTIME_CLIP_HEADER_SIZE, RUNTIME_SEGMENT_HEADER_SIZE,
};
use crate::database::streamer::{DatabaseStreamer, StreamInContinuation, StreamOutContinuation};
use crate::settings::DatabaseTier;

use log::warn;

/// Outcome of a stream-in/out request. Requests never block; asynchronicity lives in the
/// streamer's continuation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamRequestResult {
    /// Nothing left to stream for this tier.
    Done,
    /// The request was handed to the streamer.
    Dispatched,
    /// This tier already has a request in flight; retry later.
    Streaming,
    /// The context or tier has no streamer to service the request.
    NotInitialized,
}

/// Shared runtime state, kept behind an `Arc` so streamer continuations can publish from any
/// thread.
struct DatabaseRuntime {
    /// One hash per clip, indexed by runtime clip header offset.
    clip_hashes: Box<[u32]>,
    /// One `[medium, low]` tier metadata pair per segment, indexed by runtime segment header
    /// offset.
    segment_tiers: Box<[[AtomicU64; 2]]>,
    /// Global chunk residency bitset, medium tier chunks first.
    loaded_chunks: Box<[AtomicU32]>,
    /// One in-flight request flag per streamable tier.
    streaming: [AtomicBool; 2],
}

impl DatabaseRuntime {
    fn pack_tier_metadata(record: &ChunkSegmentHeader) -> u64 {
        (u64::from(record.samples_offset) << 32) | u64::from(record.sample_indices)
    }

    /// Publishes one chunk segment record into its tier slot.
    fn register(&self, tier_index: usize, record: &ChunkSegmentHeader) {
        let clip_index = (record.clip_header_offset / RUNTIME_CLIP_HEADER_SIZE) as usize;
        debug_assert_eq!(self.clip_hashes[clip_index], record.clip_hash, "unexpected clip hash");

        let segment_index = (record.segment_header_offset / RUNTIME_SEGMENT_HEADER_SIZE) as usize;
        self.segment_tiers[segment_index][tier_index]
            .store(Self::pack_tier_metadata(record), Ordering::Relaxed);
    }

    /// Withdraws one chunk segment record from its tier slot.
    fn unregister(&self, tier_index: usize, record: &ChunkSegmentHeader) {
        let segment_index = (record.segment_header_offset / RUNTIME_SEGMENT_HEADER_SIZE) as usize;
        self.segment_tiers[segment_index][tier_index].store(0, Ordering::Relaxed);
    }

    fn is_chunk_loaded(&self, global_chunk_index: u32) -> bool {
        let word = self.loaded_chunks[(global_chunk_index / 32) as usize].load(Ordering::Relaxed);
        word & (1 << (global_chunk_index % 32)) != 0
    }

    fn set_chunk_loaded(&self, global_chunk_index: u32, loaded: bool) {
        let word = &self.loaded_chunks[(global_chunk_index / 32) as usize];
        let mask = 1u32 << (global_chunk_index % 32);
        if loaded {
            word.fetch_or(mask, Ordering::Relaxed);
        }
        else {
            word.fetch_and(!mask, Ordering::Relaxed);
        }
    }
}

/// The runtime binding of a compressed database: owns the bulk data access (inline or through
/// streamers) and the per-segment tier state the decompressor samples against.
pub struct DatabaseContext<'a> {
    database: CompressedDatabase<'a>,
    runtime: Arc<DatabaseRuntime>,
    streamers: [Option<Box<dyn DatabaseStreamer + 'a>>; 2],
}

impl<'a> DatabaseContext<'a> {
    fn new_runtime(database: &CompressedDatabase<'a>) -> Arc<DatabaseRuntime> {
        let num_clips = database.num_clips() as usize;
        let num_segments = database.num_segments() as usize;
        let num_chunk_words = ((database.total_num_chunks() + 31) / 32) as usize;

        let mut clip_hashes = vec![0u32; num_clips].into_boxed_slice();
        for clip_index in 0..num_clips {
            let metadata = database.clip_metadata(clip_index as u32);
            let runtime_index = (metadata.clip_header_offset / RUNTIME_CLIP_HEADER_SIZE) as usize;
            clip_hashes[runtime_index] = metadata.clip_hash;
        }

        let segment_tiers = (0..num_segments)
            .map(|_| [AtomicU64::new(0), AtomicU64::new(0)])
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let loaded_chunks =
            (0..num_chunk_words).map(|_| AtomicU32::new(0)).collect::<Vec<_>>().into_boxed_slice();

        Arc::new(DatabaseRuntime {
            clip_hashes,
            segment_tiers,
            loaded_chunks,
            streaming: [AtomicBool::new(false), AtomicBool::new(false)],
        })
    }

    /// Binds a database whose bulk data is inline: every chunk is immediately resident.
    pub fn new(database: CompressedDatabase<'a>) -> Result<Self> {
        if !database.is_bulk_data_inline() {
            return invalid_input_error("bulk data must be inline when binding without streamers");
        }

        let runtime = Self::new_runtime(&database);
        let context = DatabaseContext { database, runtime, streamers: [None, None] };

        // Everything is already resident; register every chunk of both tiers.
        for tier_index in 0..2 {
            if let Some(bulk_data) = context.database.bulk_data(tier_index) {
                for chunk_index in 0..context.database.num_chunks(tier_index) {
                    let description = context.database.chunk_description(tier_index, chunk_index);
                    if description.size == 0 {
                        continue;
                    }

                    let (_, records) = parse_chunk(bulk_data, description.offset);
                    for record in &records {
                        context.runtime.register(tier_index, record);
                    }
                    context
                        .runtime
                        .set_chunk_loaded(context.global_chunk_index(tier_index, chunk_index), true);
                }
            }
        }

        Ok(context)
    }

    /// Binds a split database together with one streamer per streamable tier. Nothing is
    /// resident until streamed in.
    pub fn with_streamers(
        database: CompressedDatabase<'a>,
        medium_streamer: Box<dyn DatabaseStreamer + 'a>,
        low_streamer: Box<dyn DatabaseStreamer + 'a>,
    ) -> Result<Self> {
        if database.is_bulk_data_inline() {
            return invalid_input_error("bulk data is inline; bind without streamers instead");
        }

        if !medium_streamer.is_initialized() || !low_streamer.is_initialized() {
            return invalid_input_error("streamers must be initialized");
        }

        let runtime = Self::new_runtime(&database);
        Ok(DatabaseContext {
            database,
            runtime,
            streamers: [Some(medium_streamer), Some(low_streamer)],
        })
    }

    #[inline]
    pub fn database(&self) -> &CompressedDatabase<'a> {
        &self.database
    }

    fn global_chunk_index(&self, tier_index: usize, chunk_index: u32) -> u32 {
        if tier_index == 0 {
            chunk_index
        }
        else {
            self.database.num_chunks(0) + chunk_index
        }
    }

    /// Whether the given compressed tracks buffer is one of the clips bound into this database.
    pub fn contains(&self, tracks: &CompressedTracks<'_>) -> bool {
        let Some(db_header) = tracks.database_header() else { return false };

        let num_clips = self.database.num_clips();
        let num_segments = self.database.num_segments();

        if db_header.clip_header_offset >= num_clips * RUNTIME_CLIP_HEADER_SIZE {
            return false;
        }
        if db_header.segment_headers_offset >= num_segments * RUNTIME_SEGMENT_HEADER_SIZE {
            return false;
        }

        let clip_index = (db_header.clip_header_offset / RUNTIME_CLIP_HEADER_SIZE) as usize;
        self.runtime.clip_hashes[clip_index] == tracks.hash()
    }

    /// The decompressor's view of one segment: per streamable tier, the bulk byte offset of the
    /// segment's frames and the frame bitmask, zero when the tier is not resident. One relaxed
    /// load per tier.
    pub(crate) fn runtime_segment_tiers(&self, segment_header_offset: u32) -> [(u32, u32); 2] {
        let segment_index = (segment_header_offset / RUNTIME_SEGMENT_HEADER_SIZE) as usize;
        let slots = &self.runtime.segment_tiers[segment_index];

        let mut tiers = [(0u32, 0u32); 2];
        for (tier, slot) in tiers.iter_mut().zip(slots.iter()) {
            let metadata = slot.load(Ordering::Relaxed);
            *tier = ((metadata >> 32) as u32, metadata as u32);
        }
        tiers
    }

    /// The resident bulk data of one tier.
    pub(crate) fn bulk_slice(&self, tier_index: usize) -> Option<&[u8]> {
        if self.database.is_bulk_data_inline() {
            self.database.bulk_data(tier_index)
        }
        else {
            self.streamers[tier_index].as_ref().and_then(|streamer| streamer.bulk_data())
        }
    }

    /// Whether every chunk of the tier is resident.
    pub fn is_streamed_in(&self, tier: DatabaseTier) -> bool {
        let tier_index = tier.streaming_index();

        (0..self.database.num_chunks(tier_index)).all(|chunk_index| {
            let description = self.database.chunk_description(tier_index, chunk_index);
            description.size == 0
                || self.runtime.is_chunk_loaded(self.global_chunk_index(tier_index, chunk_index))
        })
    }

    /// Whether the tier has a request in flight.
    pub fn is_streaming(&self, tier: DatabaseTier) -> bool {
        self.runtime.streaming[tier.streaming_index()].load(Ordering::Relaxed)
    }

    /// Requests up to `num_chunks` more chunks of the tier to be made resident.
    pub fn stream_in(&mut self, tier: DatabaseTier, num_chunks: u32) -> StreamRequestResult {
        let tier_index = tier.streaming_index();

        if self.database.is_bulk_data_inline() {
            // Inline data is registered at bind time; there is nothing to stream.
            return StreamRequestResult::Done;
        }

        if self.streamers[tier_index].is_none() {
            return StreamRequestResult::NotInitialized;
        }

        if self.runtime.streaming[tier_index].load(Ordering::Relaxed) {
            return StreamRequestResult::Streaming;
        }

        let Some((first_chunk, run_length)) = self.find_chunk_run(tier_index, num_chunks, false)
        else {
            return StreamRequestResult::Done;
        };

        let descriptions: Vec<ChunkDescription> = (first_chunk..first_chunk + run_length)
            .map(|chunk_index| self.database.chunk_description(tier_index, chunk_index))
            .collect();

        let stream_offset = descriptions[0].offset;
        let last = descriptions.last().unwrap();
        let stream_size = last.offset + last.size - stream_offset;

        // The streamer may allocate on the first stream-in after everything was out.
        let can_allocate = (0..self.database.num_chunks(tier_index)).all(|chunk_index| {
            !self.runtime.is_chunk_loaded(self.global_chunk_index(tier_index, chunk_index))
        });

        self.runtime.streaming[tier_index].store(true, Ordering::Relaxed);

        let runtime = Arc::clone(&self.runtime);
        let global_base = self.global_chunk_index(tier_index, first_chunk);

        let continuation: StreamInContinuation = Box::new(move |bulk_data| {
            if let Some(bulk_data) = bulk_data {
                for (run_offset, description) in descriptions.iter().enumerate() {
                    let (_, records) = parse_chunk(bulk_data, description.offset);
                    for record in &records {
                        runtime.register(tier_index, record);
                    }
                    runtime.set_chunk_loaded(global_base + run_offset as u32, true);
                }
            }
            else {
                warn!("stream in request failed; tier {} remains unpublished", tier_index);
            }

            runtime.streaming[tier_index].store(false, Ordering::Relaxed);
        });

        self.streamers[tier_index].as_mut().unwrap().stream_in(
            stream_offset,
            stream_size,
            can_allocate,
            continuation,
        );

        StreamRequestResult::Dispatched
    }

    /// Requests up to `num_chunks` resident chunks of the tier to be evicted. The caller must
    /// quiesce decompression against this tier first.
    pub fn stream_out(&mut self, tier: DatabaseTier, num_chunks: u32) -> StreamRequestResult {
        let tier_index = tier.streaming_index();

        if self.database.is_bulk_data_inline() {
            return StreamRequestResult::Done;
        }

        if self.streamers[tier_index].is_none() {
            return StreamRequestResult::NotInitialized;
        }

        if self.runtime.streaming[tier_index].load(Ordering::Relaxed) {
            return StreamRequestResult::Streaming;
        }

        let Some((first_chunk, run_length)) = self.find_chunk_run(tier_index, num_chunks, true)
        else {
            return StreamRequestResult::Done;
        };

        let descriptions: Vec<ChunkDescription> = (first_chunk..first_chunk + run_length)
            .map(|chunk_index| self.database.chunk_description(tier_index, chunk_index))
            .collect();

        let stream_offset = descriptions[0].offset;
        let last = descriptions.last().unwrap();
        let stream_size = last.offset + last.size - stream_offset;

        // Withdraw the tier metadata before the data goes away.
        let bulk_data = self.bulk_slice(tier_index).expect("loaded chunks imply resident bulk data");
        for description in &descriptions {
            let (_, records) = parse_chunk(bulk_data, description.offset);
            for record in &records {
                self.runtime.unregister(tier_index, record);
            }
        }

        // The streamer may deallocate when nothing will remain resident.
        let can_deallocate = (0..self.database.num_chunks(tier_index)).all(|chunk_index| {
            let description = self.database.chunk_description(tier_index, chunk_index);
            description.size == 0
                || (chunk_index >= first_chunk && chunk_index < first_chunk + run_length)
                || !self.runtime.is_chunk_loaded(self.global_chunk_index(tier_index, chunk_index))
        });

        self.runtime.streaming[tier_index].store(true, Ordering::Relaxed);

        let runtime = Arc::clone(&self.runtime);
        let global_base = self.global_chunk_index(tier_index, first_chunk);

        let continuation: StreamOutContinuation = Box::new(move |success| {
            if success {
                for run_offset in 0..run_length {
                    runtime.set_chunk_loaded(global_base + run_offset, false);
                }
            }

            runtime.streaming[tier_index].store(false, Ordering::Relaxed);
        });

        self.streamers[tier_index].as_mut().unwrap().stream_out(
            stream_offset,
            stream_size,
            can_deallocate,
            continuation,
        );

        StreamRequestResult::Dispatched
    }

    /// Finds the first run of up to `num_chunks` consecutive chunks matching the wanted
    /// residency, skipping stripped (zero-size) chunks.
    fn find_chunk_run(&self, tier_index: usize, num_chunks: u32, wants_loaded: bool) -> Option<(u32, u32)> {
        if num_chunks == 0 {
            return None;
        }

        let total = self.database.num_chunks(tier_index);

        let mut first_chunk = None;
        let mut run_length = 0u32;

        for chunk_index in 0..total {
            let description = self.database.chunk_description(tier_index, chunk_index);
            let loaded = self.runtime.is_chunk_loaded(self.global_chunk_index(tier_index, chunk_index));

            let matches = description.size != 0 && loaded == wants_loaded;

            match (first_chunk, matches) {
                (None, true) => {
                    first_chunk = Some(chunk_index);
                    run_length = 1;
                }
                (Some(_), true) => {
                    run_length += 1;
                }
                (Some(_), false) => break,
                (None, false) => {}
            }

            if run_length == num_chunks {
                break;
            }
        }

        first_chunk.map(|first| (first, run_length))
    }
}
