// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `compression` module implements the build-time pipeline.
//!
//! Data flows one way: resample and segment, analyse ranges, convert rotations, search for bit
//! rates against the sample cache, then write the bit-packed container.

pub(crate) mod clip_context;
pub(crate) mod contributing_error;
pub(crate) mod quantize;
pub(crate) mod range;
pub(crate) mod sample_cache;
pub(crate) mod writer;

use choreia_core::errors::{invalid_input_error, Result};

use crate::container::CompressedTracksBuf;
use crate::error_metric::TransformErrorMetric;
use crate::settings::CompressionSettings;
use crate::tracks::RawTrackList;

use clip_context::ClipContext;
use log::debug;

/// Lightweight numbers describing one compression run.
#[derive(Copy, Clone, Debug, Default)]
pub struct CompressionStats {
    /// Size of the compressed buffer in bytes.
    pub total_size: u32,
    pub num_segments: u32,
    pub num_default_sub_tracks: u32,
    pub num_constant_sub_tracks: u32,
    pub num_animated_sub_tracks: u32,
}

/// Compresses a raw track list into a single self-contained buffer.
///
/// The error metric drives the per-bone bit rate search: the reconstructed pose error at every
/// sample stays below `settings.error_threshold` wherever the chosen formats can represent it.
pub fn compress_track_list(
    track_list: &RawTrackList,
    settings: &CompressionSettings,
    metric: &dyn TransformErrorMetric,
) -> Result<(CompressedTracksBuf, CompressionStats)> {
    settings.is_valid()?;

    if track_list.num_samples() == 0 {
        return invalid_input_error("cannot compress a clip with no samples");
    }

    let skeleton = track_list.skeleton();

    let raw = ClipContext::from_raw_tracks(track_list);

    let mut lossy = ClipContext::from_raw_tracks(track_list);
    lossy.convert_rotations(settings.rotation_format);
    lossy.detect_default_constant_tracks(settings);
    lossy.extract_clip_ranges();
    lossy.normalize_clip_streams(settings.range_reduction);
    lossy.split_into_segments(settings);
    lossy.extract_and_normalize_segment_ranges();

    quantize::quantize_streams(&mut lossy, &raw, skeleton, settings, metric);

    let contributing_errors = if settings.include_contributing_error {
        Some(contributing_error::calculate_contributing_error(
            &lossy, &raw, skeleton, settings, metric,
        ))
    }
    else {
        None
    };

    let compressed =
        writer::write_compressed_tracks(&lossy, &raw, track_list, settings, contributing_errors.as_deref());

    let mut stats = CompressionStats {
        total_size: compressed.view().size(),
        num_segments: lossy.segments.len() as u32,
        ..CompressionStats::default()
    };

    for bone_stream in &lossy.segments[0].bone_streams {
        let mut tally = |is_default: bool, is_constant: bool| {
            if is_default {
                stats.num_default_sub_tracks += 1;
            }
            else if is_constant {
                stats.num_constant_sub_tracks += 1;
            }
            else {
                stats.num_animated_sub_tracks += 1;
            }
        };

        tally(bone_stream.is_rotation_default, bone_stream.is_rotation_constant);
        tally(bone_stream.is_translation_default, bone_stream.is_translation_constant);
        if lossy.has_scale {
            tally(bone_stream.is_scale_default, bone_stream.is_scale_constant);
        }
    }

    debug!(
        "compressed {} bones x {} samples into {} bytes ({} segments)",
        track_list.num_bones(),
        track_list.num_samples(),
        stats.total_size,
        stats.num_segments
    );

    Ok((compressed, stats))
}
