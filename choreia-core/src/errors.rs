// Choreia
// Copyright (c) 2022 The Project Choreia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `errors` module defines the common error type.

use std::error::Error as StdError;
use std::fmt;
use std::result;

/// `BufferErrorKind` is a list of reasons why a compressed buffer may be rejected on load.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferErrorKind {
    /// The buffer is not aligned as required by its header.
    InvalidAlignment,
    /// The buffer does not start with the expected binary tag.
    InvalidTag,
    /// The buffer version is outside the supported range.
    InvalidVersion,
    /// The buffer content hash does not match the recorded hash.
    InvalidHash,
}

impl BufferErrorKind {
    fn as_str(&self) -> &'static str {
        match *self {
            BufferErrorKind::InvalidAlignment => "invalid alignment",
            BufferErrorKind::InvalidTag => "invalid tag",
            BufferErrorKind::InvalidVersion => "invalid version",
            BufferErrorKind::InvalidHash => "invalid hash",
        }
    }
}

/// `ChoreiaError` provides an enumeration of all possible errors reported by Choreia.
#[derive(Debug)]
pub enum ChoreiaError {
    /// A compressed buffer failed one of the load-time validation checks.
    BufferError(BufferErrorKind),
    /// A clip references a database it is not contained in, or a context is missing a binding.
    NotBound,
    /// A context was initialized while already holding a binding.
    AlreadyBound,
    /// Compression or database settings are out of range.
    InvalidSettings(&'static str),
    /// The input track list cannot be compressed as-is.
    InvalidInput(&'static str),
    /// The requested tier already has an in-flight streaming request. Recoverable; retry later.
    StreamingBusy,
    Other(&'static str),
}

impl fmt::Display for ChoreiaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ChoreiaError::BufferError(ref kind) => {
                write!(f, "malformed buffer: {}", kind.as_str())
            }
            ChoreiaError::NotBound => {
                write!(f, "not bound")
            }
            ChoreiaError::AlreadyBound => {
                write!(f, "already bound")
            }
            ChoreiaError::InvalidSettings(msg) => {
                write!(f, "invalid settings: {}", msg)
            }
            ChoreiaError::InvalidInput(msg) => {
                write!(f, "invalid input: {}", msg)
            }
            ChoreiaError::StreamingBusy => {
                write!(f, "streaming request already in flight")
            }
            ChoreiaError::Other(msg) => {
                write!(f, "other error: {}", msg)
            }
        }
    }
}

impl StdError for ChoreiaError {}

pub type Result<T> = result::Result<T, ChoreiaError>;

/// Convenience function to create a buffer validation error.
pub fn buffer_error<T>(kind: BufferErrorKind) -> Result<T> {
    Err(ChoreiaError::BufferError(kind))
}

/// Convenience function to create an invalid settings error.
pub fn invalid_settings_error<T>(desc: &'static str) -> Result<T> {
    Err(ChoreiaError::InvalidSettings(desc))
}

/// Convenience function to create an invalid input error.
pub fn invalid_input_error<T>(desc: &'static str) -> Result<T> {
    Err(ChoreiaError::InvalidInput(desc))
}

/// Convenience function to create a not bound error.
pub fn not_bound_error<T>() -> Result<T> {
    Err(ChoreiaError::NotBound)
}

/// Convenience function to create an already bound error.
pub fn already_bound_error<T>() -> Result<T> {
    Err(ChoreiaError::AlreadyBound)
}
