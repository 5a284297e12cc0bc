// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error type for mapping calls.

use nexus_iova::ArenaError;
use thiserror::Error;

use crate::hal::WalkError;

/// Failures of a single mapping call. Nothing the call reserved survives it.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DmaError {
    /// The arena has no free run large enough.
    #[error("iova space exhausted")]
    OutOfSpace,
    /// The trailing guard mapping could not be installed.
    #[error("guard mapping failed")]
    GuardProgramFailed,
    /// The walker rejected the translation.
    #[error("page-table programming failed: {0}")]
    PageTableProgramFailed(WalkError),
    /// Any other arena failure, including poisoning.
    #[error("arena: {0}")]
    Arena(ArenaError),
    /// Zero-length request.
    #[error("zero-length request")]
    ZeroLength,
    /// Request does not fit the address arithmetic.
    #[error("request too large")]
    TooLarge,
    /// Backing pages could not be allocated.
    #[error("out of pages")]
    NoPages,
    /// The CPU remap could not be built.
    #[error("cpu remap failed")]
    RemapFailed,
    /// No translation exists for the address.
    #[error("iova {iova:#x} is not mapped")]
    NotMapped {
        /// Address looked up.
        iova: u64,
    },
    /// The CPU address does not name a live coherent buffer.
    #[error("unknown coherent buffer")]
    UnknownBuffer,
}

impl From<ArenaError> for DmaError {
    fn from(err: ArenaError) -> Self {
        match err {
            ArenaError::OutOfSpace => DmaError::OutOfSpace,
            ArenaError::GuardProgramFailed => DmaError::GuardProgramFailed,
            other => DmaError::Arena(other),
        }
    }
}

/// Result alias for mapping calls.
pub type Result<T> = core::result::Result<T, DmaError>;
