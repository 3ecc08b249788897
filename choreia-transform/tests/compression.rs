// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end compression and decompression behavior.

mod common;

use choreia_core::buf::AlignedBuf;
use choreia_core::math::Qvv;
use choreia_core::units::SampleRoundingPolicy;

use choreia_transform::{
    compress_track_list, CompressedTracks, CompressionSettings, DecompressionContext,
    QvvTransformErrorMetric, RawTrackList, TransformTrack,
};

use common::{angular_error, chain_skeleton, static_track, waving_track_list, BufferedPose};

use glam::{Quat, Vec3};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn decompress_pose_at(
    tracks: CompressedTracks<'_>,
    sample_time: f32,
    rounding: SampleRoundingPolicy,
) -> BufferedPose {
    let mut context = DecompressionContext::new(tracks).unwrap();
    context.seek(sample_time, rounding);

    let mut pose = BufferedPose::new(tracks.num_tracks() as usize);
    context.decompress_pose(&mut pose);
    pose
}

#[test]
fn verify_two_bone_clip_with_default_tracks() {
    // Two bones over 3 samples at 30 Hz; bone 0 never moves, bone 1 slides along X.
    let skeleton = chain_skeleton(2);

    let moving_track = TransformTrack {
        rotations: vec![Quat::IDENTITY; 3],
        translations: vec![
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(3.0, 0.0, 0.0),
        ],
        scales: vec![Vec3::ONE; 3],
    };

    let track_list =
        RawTrackList::new(skeleton, vec![static_track(3), moving_track], 30.0, 3).unwrap();

    let settings = CompressionSettings { error_threshold: 1.0e-5, ..CompressionSettings::default() };
    let (compressed, stats) =
        compress_track_list(&track_list, &settings, &QvvTransformErrorMetric).unwrap();

    // Bone 0 is entirely default, bone 1's rotation is default and its translation animated.
    assert_eq!(stats.num_default_sub_tracks, 3);
    assert_eq!(stats.num_animated_sub_tracks, 1);
    assert!(stats.total_size <= 200, "compressed size: {}", stats.total_size);

    let pose = decompress_pose_at(compressed.view(), 1.0 / 60.0, SampleRoundingPolicy::None);

    assert_eq!(pose.rotations[0], Quat::IDENTITY);
    assert_eq!(pose.translations[0], Vec3::ZERO);
    assert_eq!(pose.scales[0], Vec3::ONE);
    assert!(
        pose.translations[1].abs_diff_eq(Vec3::new(1.5, 0.0, 0.0), 1.0e-4),
        "translation: {}",
        pose.translations[1]
    );
}

#[test]
fn verify_rotation_error_bound_over_random_times() {
    // One bone spinning a full turn around Y over 32 samples.
    let num_samples = 32u32;
    let skeleton = chain_skeleton(1);

    let track = TransformTrack {
        rotations: (0..num_samples)
            .map(|sample| {
                Quat::from_axis_angle(
                    Vec3::Y,
                    2.0 * std::f32::consts::PI * sample as f32 / num_samples as f32,
                )
            })
            .collect(),
        translations: vec![Vec3::ZERO; num_samples as usize],
        scales: vec![Vec3::ONE; num_samples as usize],
    };

    let track_list = RawTrackList::new(skeleton, vec![track], 30.0, num_samples).unwrap();

    let settings = CompressionSettings { error_threshold: 0.01, ..CompressionSettings::default() };
    let (compressed, _) =
        compress_track_list(&track_list, &settings, &QvvTransformErrorMetric).unwrap();

    let duration = track_list.duration();
    let mut raw_pose = [Qvv::IDENTITY; 1];
    let mut rng = SmallRng::seed_from_u64(0x5eed);

    let mut max_error = 0.0f32;
    for _ in 0..1000 {
        let sample_time = rng.random_range(0.0..=duration);

        track_list.sample_pose(sample_time, &mut raw_pose);
        let pose = decompress_pose_at(compressed.view(), sample_time, SampleRoundingPolicy::None);

        max_error = max_error.max(angular_error(raw_pose[0].rotation, pose.rotations[0]));
    }

    assert!(max_error <= 0.01, "max angular error: {}", max_error);
}

#[test]
fn verify_round_trip_error_bound_on_hierarchy() {
    // Four chained bones over 40 samples (three segments); measure the worst object-space
    // displacement of each bone against the raw pose at every sample.
    let track_list = waving_track_list(4, 40, 30.0);
    let settings = CompressionSettings::default();
    let (compressed, _) =
        compress_track_list(&track_list, &settings, &QvvTransformErrorMetric).unwrap();

    let num_bones = track_list.num_bones() as usize;
    let mut raw_pose = vec![Qvv::IDENTITY; num_bones];

    for sample_index in 0..track_list.num_samples() {
        let sample_time = sample_index as f32 / 30.0;

        track_list.sample_pose(sample_time, &mut raw_pose);
        let pose = decompress_pose_at(compressed.view(), sample_time, SampleRoundingPolicy::None);

        // Accumulate both poses into object space along the chain.
        let mut raw_object = Qvv::IDENTITY;
        let mut lossy_object = Qvv::IDENTITY;
        for bone_index in 0..num_bones {
            raw_object = raw_object.mul(&raw_pose[bone_index]);
            lossy_object = lossy_object.mul(&Qvv::new(
                pose.rotations[bone_index],
                pose.translations[bone_index],
                pose.scales[bone_index],
            ));

            let probe = Vec3::new(3.0, 0.0, 0.0);
            let error = raw_object.transform_point(probe).distance(lossy_object.transform_point(probe));
            assert!(
                error <= settings.error_threshold * 2.0,
                "bone {} sample {}: object error {}",
                bone_index,
                sample_index,
                error
            );
        }
    }
}

#[test]
fn verify_boundary_samples_match_raw() {
    let track_list = waving_track_list(2, 20, 24.0);
    let settings = CompressionSettings::default();
    let (compressed, _) =
        compress_track_list(&track_list, &settings, &QvvTransformErrorMetric).unwrap();

    let mut raw_pose = vec![Qvv::IDENTITY; 2];

    // The first and last samples anchor the clip exactly, modulo quantization.
    for sample_time in [0.0, track_list.duration()] {
        track_list.sample_pose(sample_time, &mut raw_pose);
        let pose = decompress_pose_at(compressed.view(), sample_time, SampleRoundingPolicy::None);

        for bone_index in 0..2 {
            assert!(
                angular_error(raw_pose[bone_index].rotation, pose.rotations[bone_index]) < 0.01
            );
            assert!(raw_pose[bone_index]
                .translation
                .abs_diff_eq(pose.translations[bone_index], 0.01));
        }
    }
}

#[test]
fn verify_seek_clamps_past_the_end() {
    let track_list = waving_track_list(2, 20, 24.0);
    let (compressed, _) = compress_track_list(
        &track_list,
        &CompressionSettings::default(),
        &QvvTransformErrorMetric,
    )
    .unwrap();

    let duration = track_list.duration();
    let at_end = decompress_pose_at(compressed.view(), duration, SampleRoundingPolicy::None);
    let past_end = decompress_pose_at(compressed.view(), duration * 2.0, SampleRoundingPolicy::None);

    for bone_index in 0..2 {
        assert_eq!(at_end.rotations[bone_index], past_end.rotations[bone_index]);
        assert_eq!(at_end.translations[bone_index], past_end.translations[bone_index]);
    }
}

#[test]
fn verify_single_sample_clip_is_a_static_pose() {
    let track_list = waving_track_list(2, 1, 30.0);
    let (compressed, _) = compress_track_list(
        &track_list,
        &CompressionSettings::default(),
        &QvvTransformErrorMetric,
    )
    .unwrap();

    assert_eq!(compressed.view().duration(), f32::INFINITY);

    // Every sample time resolves to the one stored pose.
    let at_zero = decompress_pose_at(compressed.view(), 0.0, SampleRoundingPolicy::None);
    let much_later = decompress_pose_at(compressed.view(), 1000.0, SampleRoundingPolicy::None);

    for bone_index in 0..2 {
        assert_eq!(at_zero.translations[bone_index], much_later.translations[bone_index]);
    }
}

#[test]
fn verify_rounding_policies_snap_to_keyframes() {
    let track_list = waving_track_list(1, 8, 30.0);
    let (compressed, _) = compress_track_list(
        &track_list,
        &CompressionSettings::default(),
        &QvvTransformErrorMetric,
    )
    .unwrap();

    let key2 = decompress_pose_at(compressed.view(), 2.0 / 30.0, SampleRoundingPolicy::None);
    let key3 = decompress_pose_at(compressed.view(), 3.0 / 30.0, SampleRoundingPolicy::None);

    let time = 2.3 / 30.0;
    let floor = decompress_pose_at(compressed.view(), time, SampleRoundingPolicy::Floor);
    let ceil = decompress_pose_at(compressed.view(), time, SampleRoundingPolicy::Ceil);
    let nearest = decompress_pose_at(compressed.view(), time, SampleRoundingPolicy::Nearest);

    assert!(floor.translations[0].abs_diff_eq(key2.translations[0], 1.0e-6));
    assert!(ceil.translations[0].abs_diff_eq(key3.translations[0], 1.0e-6));
    assert!(nearest.translations[0].abs_diff_eq(key2.translations[0], 1.0e-6));
}

#[test]
fn verify_decompress_track_matches_pose() {
    let track_list = waving_track_list(3, 24, 30.0);
    let (compressed, _) = compress_track_list(
        &track_list,
        &CompressionSettings::default(),
        &QvvTransformErrorMetric,
    )
    .unwrap();

    let sample_time = 7.4 / 30.0;
    let pose = decompress_pose_at(compressed.view(), sample_time, SampleRoundingPolicy::None);

    let mut context = DecompressionContext::new(compressed.view()).unwrap();
    context.seek(sample_time, SampleRoundingPolicy::None);

    for bone_index in 0..3 {
        let (rotation, translation, scale) = context.decompress_track(bone_index).unwrap();
        assert_eq!(rotation, pose.rotations[bone_index as usize]);
        assert_eq!(translation, pose.translations[bone_index as usize]);
        assert_eq!(scale, pose.scales[bone_index as usize]);
    }

    assert!(context.decompress_track(3).is_none());
}

#[test]
fn verify_hash_survives_a_byte_copy() {
    let track_list = waving_track_list(2, 16, 30.0);
    let (compressed, _) = compress_track_list(
        &track_list,
        &CompressionSettings::default(),
        &QvvTransformErrorMetric,
    )
    .unwrap();

    let view = compressed.view();
    assert!(view.validate_hash().is_ok());

    let copy = AlignedBuf::from_slice(compressed.as_bytes());
    let copied_view = CompressedTracks::bound(&copy).unwrap();
    assert_eq!(copied_view.hash(), view.hash());
    assert_eq!(copied_view.compute_hash(), view.hash());
    assert!(copied_view.validate_hash().is_ok());
}

#[test]
fn verify_segment_constant_rotations_store_zero_animated_bits() {
    // 32 samples, two segments; the rotation is constant within each segment but differs
    // between them, so each segment stores it at bit rate 0 with no animated rotation bits.
    let num_samples = 32usize;
    let skeleton = chain_skeleton(1);

    let first = Quat::from_axis_angle(Vec3::Y, 0.3);
    let second = Quat::from_axis_angle(Vec3::Y, 1.1);

    let stepped_track = TransformTrack {
        rotations: (0..num_samples).map(|i| if i < 16 { first } else { second }).collect(),
        translations: (0..num_samples).map(|i| Vec3::new(i as f32 * 0.1, 0.0, 0.0)).collect(),
        scales: vec![Vec3::ONE; num_samples],
    };

    let smooth_track = TransformTrack {
        rotations: (0..num_samples)
            .map(|i| Quat::from_axis_angle(Vec3::Y, 0.3 + i as f32 * 0.05))
            .collect(),
        ..stepped_track.clone()
    };

    let settings = CompressionSettings::default();

    let stepped_list =
        RawTrackList::new(skeleton.clone(), vec![stepped_track], 30.0, num_samples as u32).unwrap();
    let (stepped, _) =
        compress_track_list(&stepped_list, &settings, &QvvTransformErrorMetric).unwrap();

    let smooth_list =
        RawTrackList::new(skeleton, vec![smooth_track], 30.0, num_samples as u32).unwrap();
    let (smooth, _) = compress_track_list(&smooth_list, &settings, &QvvTransformErrorMetric).unwrap();

    // The segment-constant rotation costs nothing per frame, so the clip shrinks.
    assert!(stepped.view().size() < smooth.view().size());

    // And it still decompresses to the right rotation on both sides of the split.
    let early = decompress_pose_at(stepped.view(), 4.0 / 30.0, SampleRoundingPolicy::None);
    assert!(angular_error(early.rotations[0], first) < 0.01);

    let late = decompress_pose_at(stepped.view(), 25.0 / 30.0, SampleRoundingPolicy::None);
    assert!(angular_error(late.rotations[0], second) < 0.01);

    // The translation stream is unaffected by how the rotation was stored.
    let pose = decompress_pose_at(stepped.view(), 10.0 / 30.0, SampleRoundingPolicy::None);
    assert!(pose.translations[0].abs_diff_eq(Vec3::new(1.0, 0.0, 0.0), 0.01));
}
