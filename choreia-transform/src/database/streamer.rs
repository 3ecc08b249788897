// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `streamer` module defines how bulk data pages in and out.
//!
//! A streamer is a passive resource owned by a [`DatabaseContext`](crate::DatabaseContext),
//! one per streamable tier. It owns the tier's bulk data allocation and fulfils requests
//! synchronously or asynchronously; the runtime never blocks on it. On completion the streamer
//! invokes the request's continuation, which may happen on any thread.

/// Invoked when a stream-in request completes. On success the streamer passes its resident
/// bulk data so the newly arrived chunk headers can be registered; on failure it passes `None`
/// and the pending tier publication is cancelled.
pub type StreamInContinuation = Box<dyn for<'a> FnOnce(Option<&'a [u8]>) + Send>;

/// Invoked when a stream-out request completes, with its success flag.
pub type StreamOutContinuation = Box<dyn FnOnce(bool) + Send>;

/// Pages one tier's bulk data in and out.
///
/// At most one request per streamer is in flight at a time. The bulk data pointer must remain
/// stable between allocation events: it may only change when every chunk has been streamed out
/// and `can_deallocate` was set.
pub trait DatabaseStreamer {
    /// Whether the streamer is ready to service requests.
    fn is_initialized(&self) -> bool;

    /// The tier's resident bulk data. May be `None` until the first successful stream-in
    /// request completes.
    fn bulk_data(&self) -> Option<&[u8]>;

    /// Requests `[offset, offset + size)` of the tier's bulk data to be made resident.
    /// `can_allocate` is set when no other chunk is resident, so the allocation may be created.
    /// The continuation must be invoked exactly once.
    fn stream_in(&mut self, offset: u32, size: u32, can_allocate: bool, continuation: StreamInContinuation);

    /// Requests `[offset, offset + size)` of the tier's bulk data to be evicted.
    /// `can_deallocate` is set when no chunk will remain resident afterwards. The caller
    /// guarantees no decompression against this tier is in progress. The continuation must be
    /// invoked exactly once.
    fn stream_out(&mut self, offset: u32, size: u32, can_deallocate: bool, continuation: StreamOutContinuation);
}

/// An in-memory streamer for tests and tooling: stream-in copies from a pristine source copy,
/// stream-out poisons the evicted range so stale reads are loud.
pub struct DebugStreamer {
    source: Vec<u8>,
    resident: Vec<u8>,
}

const POISON_BYTE: u8 = 0xcd;

impl DebugStreamer {
    pub fn new(bulk_data: &[u8]) -> Self {
        DebugStreamer {
            source: bulk_data.to_vec(),
            resident: vec![POISON_BYTE; bulk_data.len()],
        }
    }

    /// The resident copy, for test inspection.
    pub fn resident_bytes(&self) -> &[u8] {
        &self.resident
    }
}

impl DatabaseStreamer for DebugStreamer {
    fn is_initialized(&self) -> bool {
        true
    }

    fn bulk_data(&self) -> Option<&[u8]> {
        Some(&self.resident)
    }

    fn stream_in(&mut self, offset: u32, size: u32, _can_allocate: bool, continuation: StreamInContinuation) {
        let start = offset as usize;
        let end = start + size as usize;
        self.resident[start..end].copy_from_slice(&self.source[start..end]);
        continuation(Some(&self.resident));
    }

    fn stream_out(&mut self, offset: u32, size: u32, _can_deallocate: bool, continuation: StreamOutContinuation) {
        let start = offset as usize;
        let end = start + size as usize;
        self.resident[start..end].fill(POISON_BYTE);
        continuation(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_debug_streamer_round_trip() {
        let source: Vec<u8> = (0..64u8).collect();
        let mut streamer = DebugStreamer::new(&source);

        assert!(streamer.is_initialized());
        assert!(streamer.resident_bytes().iter().all(|&byte| byte == POISON_BYTE));

        streamer.stream_in(16, 16, true, Box::new(|bulk| assert!(bulk.is_some())));
        streamer.stream_out(16, 8, false, Box::new(|success| assert!(success)));

        assert!(streamer.resident_bytes()[..16].iter().all(|&byte| byte == POISON_BYTE));
        assert!(streamer.resident_bytes()[16..24].iter().all(|&byte| byte == POISON_BYTE));
        assert_eq!(&streamer.resident_bytes()[24..32], &source[24..32]);
    }
}
