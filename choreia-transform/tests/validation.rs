// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Container validation on load: alignment, tag, version, and hash checks.

mod common;

use choreia_core::buf::AlignedBuf;
use choreia_core::errors::{BufferErrorKind, ChoreiaError};

use choreia_transform::{
    compress_track_list, CompressedTracks, CompressionSettings, QvvTransformErrorMetric,
};

use common::waving_track_list;

fn compressed_bytes() -> AlignedBuf {
    let track_list = waving_track_list(2, 16, 30.0);
    let (compressed, _) = compress_track_list(
        &track_list,
        &CompressionSettings::default(),
        &QvvTransformErrorMetric,
    )
    .unwrap();
    AlignedBuf::from_slice(compressed.as_bytes())
}

fn expect_buffer_error(result: choreia_core::errors::Result<CompressedTracks<'_>>, kind: BufferErrorKind) {
    match result {
        Err(ChoreiaError::BufferError(actual)) => assert_eq!(actual, kind),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("expected the buffer to be rejected"),
    }
}

#[test]
fn verify_valid_buffer_binds() {
    let bytes = compressed_bytes();
    let tracks = CompressedTracks::bound(&bytes).unwrap();
    assert!(tracks.validate_hash().is_ok());
}

#[test]
fn verify_misaligned_buffer_is_rejected() {
    let bytes = compressed_bytes();

    // Shift the buffer off its 16-byte alignment.
    let mut shifted = vec![0u8; bytes.len() + 1];
    shifted[1..].copy_from_slice(&bytes);

    expect_buffer_error(CompressedTracks::bound(&shifted[1..]), BufferErrorKind::InvalidAlignment);
}

#[test]
fn verify_bad_tag_is_rejected() {
    let mut bytes = compressed_bytes();
    // The tag sits right after the raw buffer header.
    bytes[8] ^= 0xff;

    expect_buffer_error(CompressedTracks::bound(&bytes), BufferErrorKind::InvalidTag);
}

#[test]
fn verify_future_version_is_rejected() {
    let mut bytes = compressed_bytes();
    // The version follows the tag.
    bytes[12] = 0xff;
    bytes[13] = 0x7f;

    expect_buffer_error(CompressedTracks::bound(&bytes), BufferErrorKind::InvalidVersion);
}

#[test]
fn verify_corruption_fails_the_hash_check() {
    let mut bytes = compressed_bytes();

    // Binding succeeds without the hash check; flipping a payload byte fails it.
    let last = bytes.len() - 20;
    bytes[last] ^= 0x01;

    let tracks = CompressedTracks::bound(&bytes).unwrap();
    match tracks.validate_hash() {
        Err(ChoreiaError::BufferError(BufferErrorKind::InvalidHash)) => {}
        other => panic!("expected a hash failure, got {:?}", other.err()),
    }
}

#[test]
fn verify_truncated_buffer_is_rejected() {
    let bytes = compressed_bytes();
    let truncated = AlignedBuf::from_slice(&bytes[..16]);
    assert!(CompressedTracks::bound(&truncated).is_err());
}
