// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `settings` module defines the compression and database configuration.

use choreia_core::checksum::{hash_combine32, hash32};
use choreia_core::errors::{invalid_settings_error, Result};

use bitflags::bitflags;

/// Storage format of rotation sub-tracks.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RotationFormat {
    /// Four full-precision float components.
    QuatFull,
    /// Three full-precision float components, W reconstructed from the positive-W invariant.
    QuatDropWFull,
    /// Three components at a per-bone, per-segment variable bit rate.
    #[default]
    QuatDropWVariable,
}

impl RotationFormat {
    #[inline]
    pub fn is_variable(&self) -> bool {
        matches!(self, RotationFormat::QuatDropWVariable)
    }

    /// The number of components carried by range data and full-precision samples.
    #[inline]
    pub fn num_components(&self) -> u32 {
        match *self {
            RotationFormat::QuatFull => 4,
            _ => 3,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            RotationFormat::QuatFull => 0,
            RotationFormat::QuatDropWFull => 1,
            RotationFormat::QuatDropWVariable => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RotationFormat::QuatFull),
            1 => Some(RotationFormat::QuatDropWFull),
            2 => Some(RotationFormat::QuatDropWVariable),
            _ => None,
        }
    }
}

/// Storage format of translation and scale sub-tracks.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum VectorFormat {
    /// Three full-precision float components.
    Vec3Full,
    /// Three components at a per-bone, per-segment variable bit rate.
    #[default]
    Vec3Variable,
}

impl VectorFormat {
    #[inline]
    pub fn is_variable(&self) -> bool {
        matches!(self, VectorFormat::Vec3Variable)
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            VectorFormat::Vec3Full => 0,
            VectorFormat::Vec3Variable => 1,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(VectorFormat::Vec3Full),
            1 => Some(VectorFormat::Vec3Variable),
            _ => None,
        }
    }
}

/// How much compression time to spend searching for smaller bit rates.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum CompressionLevel {
    Lowest,
    Low,
    #[default]
    Medium,
    High,
    Highest,
}

bitflags! {
    /// Which channel families are range reduced at the clip level.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct RangeReductionFlags: u8 {
        const ROTATIONS = 0x01;
        const TRANSLATIONS = 0x02;
        const SCALES = 0x04;
    }
}

/// Settings driving [`compress_track_list`](crate::compress_track_list).
#[derive(Clone, Debug)]
pub struct CompressionSettings {
    pub rotation_format: RotationFormat,
    pub translation_format: VectorFormat,
    pub scale_format: VectorFormat,
    pub level: CompressionLevel,
    pub range_reduction: RangeReductionFlags,

    /// The maximum tolerated error, in the unit of the error metric (typically centimeters of
    /// virtual vertex displacement).
    pub error_threshold: f32,

    /// Preferred number of samples per segment.
    pub ideal_num_samples_per_segment: u32,
    /// Hard ceiling on samples per segment. Limited to 32 by the per-segment sample bitmask.
    pub max_num_samples_per_segment: u32,

    /// A rotation within this angle of identity on every sample is a default track.
    pub constant_rotation_threshold_angle: f32,
    /// A translation within this distance of its first sample on every sample is constant.
    pub constant_translation_threshold: f32,
    /// A scale within this factor of its first sample on every sample is constant.
    pub constant_scale_threshold: f32,

    /// When set, a contributing-error metadata block is appended to the compressed clip so it
    /// can later feed a streaming database.
    pub include_contributing_error: bool,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        CompressionSettings {
            rotation_format: RotationFormat::default(),
            translation_format: VectorFormat::default(),
            scale_format: VectorFormat::default(),
            level: CompressionLevel::default(),
            range_reduction: RangeReductionFlags::all(),
            error_threshold: 0.01,
            ideal_num_samples_per_segment: 16,
            max_num_samples_per_segment: 32,
            constant_rotation_threshold_angle: 0.00284714461,
            constant_translation_threshold: 0.001,
            constant_scale_threshold: 0.00001,
            include_contributing_error: false,
        }
    }
}

impl CompressionSettings {
    pub fn is_valid(&self) -> Result<()> {
        if !self.error_threshold.is_finite() || self.error_threshold <= 0.0 {
            return invalid_settings_error("error threshold must be finite and positive");
        }

        if self.ideal_num_samples_per_segment < 8 {
            return invalid_settings_error("segments need at least 8 samples");
        }

        if self.max_num_samples_per_segment > 32 {
            return invalid_settings_error("segments cannot exceed 32 samples");
        }

        if self.ideal_num_samples_per_segment > self.max_num_samples_per_segment {
            return invalid_settings_error("ideal segment size exceeds the maximum");
        }

        // Variable bit rates quantize against a clip-level range; bit rate 0 stores its one
        // sample in that range's space.
        if self.rotation_format.is_variable()
            && !self.range_reduction.contains(RangeReductionFlags::ROTATIONS)
        {
            return invalid_settings_error("variable rotations require rotation range reduction");
        }

        if self.translation_format.is_variable()
            && !self.range_reduction.contains(RangeReductionFlags::TRANSLATIONS)
        {
            return invalid_settings_error(
                "variable translations require translation range reduction",
            );
        }

        if self.scale_format.is_variable()
            && !self.range_reduction.contains(RangeReductionFlags::SCALES)
        {
            return invalid_settings_error("variable scales require scale range reduction");
        }

        if !self.constant_rotation_threshold_angle.is_finite()
            || !self.constant_translation_threshold.is_finite()
            || !self.constant_scale_threshold.is_finite()
        {
            return invalid_settings_error("constant thresholds must be finite");
        }

        Ok(())
    }

    /// Fingerprints the settings so artefacts can be matched to the configuration that produced
    /// them.
    pub fn get_hash(&self) -> u32 {
        let fields = [
            self.rotation_format.to_u8() as u32,
            self.translation_format.to_u8() as u32,
            self.scale_format.to_u8() as u32,
            self.level as u32,
            self.range_reduction.bits() as u32,
            self.error_threshold.to_bits(),
            self.ideal_num_samples_per_segment,
            self.max_num_samples_per_segment,
            self.constant_rotation_threshold_angle.to_bits(),
            self.constant_translation_threshold.to_bits(),
            self.constant_scale_threshold.to_bits(),
            self.include_contributing_error as u32,
        ];

        let mut hash = 0;
        for field in fields {
            hash = hash_combine32(hash, hash32(&field.to_le_bytes()));
        }
        hash
    }
}

/// The importance tiers a keyframe can be assigned to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DatabaseTier {
    /// Always inline in the compressed clip.
    HighImportance,
    /// Streamable, paged in before the lowest tier.
    MediumImportance,
    /// Streamable, the first data to sacrifice.
    LowImportance,
}

impl DatabaseTier {
    /// Index of a streamable tier into tier-indexed arrays. The high-importance tier is inline
    /// and carries no such index.
    pub(crate) fn streaming_index(&self) -> usize {
        match *self {
            DatabaseTier::HighImportance => panic!("the high importance tier does not stream"),
            DatabaseTier::MediumImportance => 0,
            DatabaseTier::LowImportance => 1,
        }
    }
}

/// Settings driving [`build_database`](crate::build_database).
#[derive(Clone, Debug)]
pub struct DatabaseSettings {
    /// Maximum size of a bulk data chunk, in bytes. Must be a power of two.
    pub max_chunk_size: u32,
    /// Proportion of movable keyframes assigned to the medium importance tier, in `[0, 1]`.
    pub medium_importance_tier_proportion: f32,
    /// Proportion of movable keyframes assigned to the lowest importance tier, in `[0, 1]`.
    pub low_importance_tier_proportion: f32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            max_chunk_size: 1024 * 1024,
            medium_importance_tier_proportion: 0.5,
            low_importance_tier_proportion: 0.5,
        }
    }
}

impl DatabaseSettings {
    pub fn is_valid(&self) -> Result<()> {
        if !self.max_chunk_size.is_power_of_two() {
            return invalid_settings_error("max chunk size must be a power of two");
        }

        // A chunk must fit its header, one segment record, and one frame of data.
        if self.max_chunk_size < 4096 {
            return invalid_settings_error("max chunk size must be at least 4 KiB");
        }

        let medium = self.medium_importance_tier_proportion;
        let low = self.low_importance_tier_proportion;

        if !medium.is_finite() || !low.is_finite() || medium < 0.0 || low < 0.0 {
            return invalid_settings_error("tier proportions must be finite and non-negative");
        }

        if medium + low > 1.0 {
            return invalid_settings_error("tier proportions cannot sum above 1.0");
        }

        Ok(())
    }

    pub fn get_hash(&self) -> u32 {
        let fields = [
            self.max_chunk_size,
            self.medium_importance_tier_proportion.to_bits(),
            self.low_importance_tier_proportion.to_bits(),
        ];

        let mut hash = 0;
        for field in fields {
            hash = hash_combine32(hash, hash32(&field.to_le_bytes()));
        }
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_default_settings_are_valid() {
        assert!(CompressionSettings::default().is_valid().is_ok());
        assert!(DatabaseSettings::default().is_valid().is_ok());
    }

    #[test]
    fn verify_threshold_validation() {
        let mut settings = CompressionSettings::default();
        settings.error_threshold = f32::NAN;
        assert!(settings.is_valid().is_err());

        settings.error_threshold = 0.0;
        assert!(settings.is_valid().is_err());
    }

    #[test]
    fn verify_variable_formats_require_range_reduction() {
        let mut settings = CompressionSettings::default();
        settings.range_reduction = RangeReductionFlags::TRANSLATIONS | RangeReductionFlags::SCALES;
        assert!(settings.is_valid().is_err());

        settings.rotation_format = RotationFormat::QuatFull;
        assert!(settings.is_valid().is_ok());
    }

    #[test]
    fn verify_database_settings_validation() {
        let mut settings = DatabaseSettings::default();
        settings.max_chunk_size = 1000;
        assert!(settings.is_valid().is_err());

        settings.max_chunk_size = 4096;
        settings.medium_importance_tier_proportion = 0.7;
        settings.low_importance_tier_proportion = 0.5;
        assert!(settings.is_valid().is_err());
    }

    #[test]
    fn verify_settings_hash_tracks_changes() {
        let settings = CompressionSettings::default();
        let mut changed = settings.clone();
        changed.error_threshold = 0.05;
        assert_ne!(settings.get_hash(), changed.get_hash());
    }
}
