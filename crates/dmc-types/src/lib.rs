#![forbid(unsafe_code)]
//! Unit-carrying block identifiers and cache geometry.
//!
//! Origin blocks and cache blocks live in different address spaces; the
//! newtypes here keep them from being mixed up at call sites.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Bytes per sector, the unit `origin_size` and `block_size` are given in.
pub const SECTOR_SIZE: u64 = 512;

/// Logical block number on the slow origin device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OriginBlock(pub u64);

impl fmt::Display for OriginBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oblock:{}", self.0)
    }
}

/// Slot index on the fast cache device, always `< cache_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheBlock(pub u32);

impl CacheBlock {
    /// Index form for addressing bitsets and arenas.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CacheBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cblock:{}", self.0)
    }
}

/// Result of a successful `map` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapOutcome {
    /// The origin block was already resident.
    Hit(CacheBlock),
    /// A free cache block was assigned.
    New(CacheBlock),
    /// The oldest mapping was evicted and its cache block reassigned.
    ///
    /// The caller must invalidate anything tagged with `old_oblock` before
    /// reusing the storage.
    Replace {
        old_oblock: OriginBlock,
        cblock: CacheBlock,
    },
}

impl MapOutcome {
    /// Cache block the origin block now maps to.
    #[must_use]
    pub fn cblock(self) -> CacheBlock {
        match self {
            Self::Hit(cblock) | Self::New(cblock) | Self::Replace { cblock, .. } => cblock,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Validated cache geometry fixed at policy construction.
///
/// Only `cache_size` drives the policy; the origin size and block size are
/// carried for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyGeometry {
    cache_size: u32,
    origin_size: u64,
    block_size: u64,
}

impl PolicyGeometry {
    /// `origin_size` and `block_size` are in sectors.
    pub fn new(cache_size: u32, origin_size: u64, block_size: u64) -> Result<Self, GeometryError> {
        if cache_size == 0 {
            return Err(GeometryError::InvalidField {
                field: "cache_size",
                reason: "must be > 0",
            });
        }
        if block_size == 0 {
            return Err(GeometryError::InvalidField {
                field: "block_size",
                reason: "must be > 0",
            });
        }
        Ok(Self {
            cache_size,
            origin_size,
            block_size,
        })
    }

    #[must_use]
    pub fn cache_size(&self) -> u32 {
        self.cache_size
    }

    #[must_use]
    pub fn origin_size(&self) -> u64 {
        self.origin_size
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Number of whole blocks on the origin device.
    #[must_use]
    pub fn origin_blocks(&self) -> u64 {
        self.origin_size / self.block_size
    }

    /// Cache device capacity in bytes, `None` on overflow.
    #[must_use]
    pub fn cache_bytes(&self) -> Option<u64> {
        u64::from(self.cache_size)
            .checked_mul(self.block_size)?
            .checked_mul(SECTOR_SIZE)
    }
}
