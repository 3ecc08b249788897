// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end streaming database behavior: build, split, strip, merge, and tiered playback.

mod common;

use choreia_core::math::Qvv;
use choreia_core::units::SampleRoundingPolicy;

use choreia_transform::{
    build_database, compress_track_list, join_compressed_database_bulk_data,
    merge_compressed_databases, split_compressed_database_bulk_data, strip_quality_tier,
    CompressedTracksBuf, CompressionSettings, DatabaseContext, DatabaseMergeMapping,
    DatabaseSettings, DatabaseTier, DebugStreamer, DecompressionContext, QvvTransformErrorMetric,
    RawTrackList, StreamRequestResult,
};

use common::{waving_track_list, BufferedPose};

fn compress_for_database(track_list: &RawTrackList) -> CompressedTracksBuf {
    let settings =
        CompressionSettings { include_contributing_error: true, ..CompressionSettings::default() };
    compress_track_list(track_list, &settings, &QvvTransformErrorMetric).unwrap().0
}

fn database_settings(medium: f32, low: f32) -> DatabaseSettings {
    DatabaseSettings {
        max_chunk_size: 4096,
        medium_importance_tier_proportion: medium,
        low_importance_tier_proportion: low,
    }
}

/// Decompresses every bone at `sample_time` through the given database context.
fn decompress_with_database(
    tracks: &CompressedTracksBuf,
    database: &DatabaseContext<'_>,
    sample_time: f32,
) -> BufferedPose {
    let view = tracks.view();
    let mut context = DecompressionContext::with_database(view, database).unwrap();
    context.seek(sample_time, SampleRoundingPolicy::None);

    let mut pose = BufferedPose::new(view.num_tracks() as usize);
    context.decompress_pose(&mut pose);
    pose
}

/// The worst positional error of a database-backed clip against its raw source, over every
/// sample.
fn max_error_against_raw(
    track_list: &RawTrackList,
    tracks: &CompressedTracksBuf,
    database: &DatabaseContext<'_>,
) -> f32 {
    let num_bones = track_list.num_bones() as usize;
    let mut raw_pose = vec![Qvv::IDENTITY; num_bones];
    let mut max_error = 0.0f32;

    for sample_index in 0..track_list.num_samples() {
        let sample_time = sample_index as f32 / track_list.sample_rate();
        track_list.sample_pose(sample_time, &mut raw_pose);

        let pose = decompress_with_database(tracks, database, sample_time);
        for bone_index in 0..num_bones {
            max_error = max_error
                .max(raw_pose[bone_index].translation.distance(pose.translations[bone_index]));
        }
    }

    max_error
}

#[test]
fn verify_database_structure_and_strip_commutativity() {
    // Two clips of 64 samples each split into four segments apiece.
    let list_a = waving_track_list(2, 64, 30.0);
    let list_b = waving_track_list(3, 64, 30.0);

    let compressed_a = compress_for_database(&list_a);
    let compressed_b = compress_for_database(&list_b);

    let settings = database_settings(0.3, 0.3);
    let (rewritten, database) =
        build_database(&settings, &[compressed_a, compressed_b]).unwrap();

    assert_eq!(rewritten.len(), 2);

    let view = database.view();
    assert!(view.validate_hash().is_ok());
    assert_eq!(view.num_clips(), 2);
    assert_eq!(view.num_segments(), 8);
    assert!(view.is_bulk_data_inline());

    // Stripping is commutative, byte for byte.
    let medium_then_low = {
        let first = strip_quality_tier(&view, DatabaseTier::MediumImportance).unwrap();
        strip_quality_tier(&first.view(), DatabaseTier::LowImportance).unwrap()
    };
    let low_then_medium = {
        let first = strip_quality_tier(&view, DatabaseTier::LowImportance).unwrap();
        strip_quality_tier(&first.view(), DatabaseTier::MediumImportance).unwrap()
    };
    assert_eq!(medium_then_low.as_bytes(), low_then_medium.as_bytes());

    // Stripping the low tier leaves the medium tier's bulk data untouched.
    let stripped_low = strip_quality_tier(&view, DatabaseTier::LowImportance).unwrap();
    let stripped_view = stripped_low.view();
    assert!(stripped_view.validate_hash().is_ok());

    let medium_before = view.bulk_data(0).unwrap();
    let medium_after = stripped_view.bulk_data(0).unwrap();
    assert_eq!(medium_before, medium_after);
    assert!(stripped_view.bulk_data(1).is_none());
}

#[test]
fn verify_split_and_join_round_trip() {
    let list = waving_track_list(2, 64, 30.0);
    let compressed = compress_for_database(&list);

    let (_, database) = build_database(&database_settings(0.25, 0.25), &[compressed]).unwrap();
    let view = database.view();

    let (split_database, bulk_medium, bulk_low) =
        split_compressed_database_bulk_data(&view).unwrap();

    let split_view = split_database.view();
    assert!(!split_view.is_bulk_data_inline());
    assert!(split_view.validate_hash().is_ok());
    assert!(split_view.size() < view.size());

    // Splitting loses only the alignment padding between the regions.
    assert!(split_view.total_size() <= view.size());
    assert!(split_view.total_size() + 8 > view.size());

    let joined =
        join_compressed_database_bulk_data(&split_view, &bulk_medium, &bulk_low).unwrap();
    assert_eq!(joined.as_bytes(), database.as_bytes());
}

#[test]
fn verify_tier_monotonicity_and_full_fidelity() {
    let list = waving_track_list(2, 64, 30.0);
    let compressed = compress_for_database(&list);
    let original_size = compressed.view().size();

    let settings = database_settings(0.35, 0.35);
    let (rewritten, database) = build_database(&settings, &[compressed]).unwrap();
    let tracks = &rewritten[0];

    // Moving frames out must shrink the clip.
    assert!(tracks.view().size() < original_size);

    // Reference error with everything inline.
    let inline_context = DatabaseContext::new(database.view()).unwrap();
    assert!(inline_context.contains(&tracks.view()));
    let reference_error = max_error_against_raw(&list, tracks, &inline_context);

    // Split the bulk data out and stream through debug streamers.
    let (split_database, bulk_medium, bulk_low) =
        split_compressed_database_bulk_data(&database.view()).unwrap();
    let split_view = split_database.view();

    let mut context = DatabaseContext::with_streamers(
        split_view,
        Box::new(DebugStreamer::new(&bulk_medium)),
        Box::new(DebugStreamer::new(&bulk_low)),
    )
    .unwrap();

    let error_no_tiers = max_error_against_raw(&list, tracks, &context);

    assert_eq!(context.stream_in(DatabaseTier::MediumImportance, u32::MAX), StreamRequestResult::Dispatched);
    assert!(context.is_streamed_in(DatabaseTier::MediumImportance));
    let error_medium = max_error_against_raw(&list, tracks, &context);

    assert_eq!(context.stream_in(DatabaseTier::LowImportance, u32::MAX), StreamRequestResult::Dispatched);
    assert!(context.is_streamed_in(DatabaseTier::LowImportance));
    let error_all = max_error_against_raw(&list, tracks, &context);

    // Streaming more tiers in never increases error, and everything in matches the inline
    // reference exactly.
    assert!(error_no_tiers >= error_medium);
    assert!(error_medium >= error_all);
    assert!((error_all - reference_error).abs() < 1.0e-6);

    // Nothing left to stream.
    assert_eq!(context.stream_in(DatabaseTier::MediumImportance, u32::MAX), StreamRequestResult::Done);
}

#[test]
fn verify_streaming_is_idempotent() {
    let list = waving_track_list(2, 48, 30.0);
    let compressed = compress_for_database(&list);

    let (rewritten, database) = build_database(&database_settings(0.4, 0.2), &[compressed]).unwrap();
    let tracks = &rewritten[0];

    let (split_database, bulk_medium, bulk_low) =
        split_compressed_database_bulk_data(&database.view()).unwrap();

    let mut context = DatabaseContext::with_streamers(
        split_database.view(),
        Box::new(DebugStreamer::new(&bulk_medium)),
        Box::new(DebugStreamer::new(&bulk_low)),
    )
    .unwrap();

    context.stream_in(DatabaseTier::MediumImportance, u32::MAX);
    context.stream_in(DatabaseTier::LowImportance, u32::MAX);

    let sample_time = 17.0 / 30.0;
    let before = decompress_with_database(tracks, &context, sample_time);

    // Stream the medium tier out and back in; playback is unchanged.
    assert_eq!(context.stream_out(DatabaseTier::MediumImportance, u32::MAX), StreamRequestResult::Dispatched);
    assert!(!context.is_streamed_in(DatabaseTier::MediumImportance));

    assert_eq!(context.stream_in(DatabaseTier::MediumImportance, u32::MAX), StreamRequestResult::Dispatched);
    assert!(context.is_streamed_in(DatabaseTier::MediumImportance));

    let after = decompress_with_database(tracks, &context, sample_time);

    for bone_index in 0..list.num_bones() as usize {
        assert_eq!(before.rotations[bone_index], after.rotations[bone_index]);
        assert_eq!(before.translations[bone_index], after.translations[bone_index]);
    }
}

#[test]
fn verify_merge_matches_a_combined_build() {
    // With the full movable set assigned to one tier, per-clip and combined builds agree on
    // every frame assignment, so merging singleton databases must reproduce the combined
    // database bit for bit.
    let list_a = waving_track_list(2, 64, 30.0);
    let list_b = waving_track_list(3, 48, 30.0);

    let settings = database_settings(1.0, 0.0);

    let combined = build_database(
        &settings,
        &[compress_for_database(&list_a), compress_for_database(&list_b)],
    )
    .unwrap();

    let (mut singles_a, database_a) =
        build_database(&settings, &[compress_for_database(&list_a)]).unwrap();
    let (mut singles_b, database_b) =
        build_database(&settings, &[compress_for_database(&list_b)]).unwrap();

    let mut mappings = vec![
        DatabaseMergeMapping { tracks: &mut singles_a[0], database: &database_a },
        DatabaseMergeMapping { tracks: &mut singles_b[0], database: &database_b },
    ];

    let merged = merge_compressed_databases(&settings, &mut mappings).unwrap();

    assert_eq!(merged.as_bytes(), combined.1.as_bytes());
    assert_eq!(singles_a[0].as_bytes(), combined.0[0].as_bytes());
    assert_eq!(singles_b[0].as_bytes(), combined.0[1].as_bytes());
}

#[test]
fn verify_database_requires_metadata() {
    let list = waving_track_list(1, 32, 30.0);
    let (compressed, _) = compress_track_list(
        &list,
        &CompressionSettings::default(),
        &QvvTransformErrorMetric,
    )
    .unwrap();

    assert!(build_database(&database_settings(0.5, 0.5), &[compressed]).is_err());
}
