//! Chunk key ranges
//!
//! Shard keys are the integer `_id` of a document. A chunk covers the
//! half-open interval `[min, max)`.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkRange {
    pub min: i64,
    pub max: i64,
}

impl ChunkRange {
    pub fn new(min: i64, max: i64) -> Result<Self> {
        let range = Self { min, max };
        range.validate()?;
        Ok(range)
    }

    /// The whole key space, the single chunk of a freshly sharded collection
    pub fn full() -> Self {
        Self {
            min: i64::MIN,
            max: i64::MAX,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min >= self.max {
            return Err(Error::InvalidRange(format!(
                "min {} must be below max {}",
                self.min, self.max
            )));
        }
        Ok(())
    }

    pub fn contains(&self, key: i64) -> bool {
        self.min <= key && key < self.max
    }

    pub fn overlaps(&self, other: &ChunkRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    /// Split into `[min, at)` and `[at, max)`
    pub fn split_at(&self, at: i64) -> Result<(ChunkRange, ChunkRange)> {
        if !(self.min < at && at < self.max) {
            return Err(Error::InvalidRange(format!(
                "split point {} is not strictly inside {}",
                at, self
            )));
        }
        Ok((
            ChunkRange {
                min: self.min,
                max: at,
            },
            ChunkRange {
                min: at,
                max: self.max,
            },
        ))
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lo = if self.min == i64::MIN {
            "MinKey".to_string()
        } else {
            self.min.to_string()
        };
        let hi = if self.max == i64::MAX {
            "MaxKey".to_string()
        } else {
            self.max.to_string()
        };
        write!(f, "[{}, {})", lo, hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_is_half_open() {
        let a = ChunkRange::new(0, 10).unwrap();
        let b = ChunkRange::new(10, 20).unwrap();
        let c = ChunkRange::new(5, 15).unwrap();
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&b));
        assert!(ChunkRange::full().overlaps(&a));
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        assert!(ChunkRange::new(5, 5).is_err());
        assert!(ChunkRange::new(6, 5).is_err());
    }

    #[test]
    fn test_split() {
        let (lo, hi) = ChunkRange::full().split_at(100).unwrap();
        assert!(lo.contains(99));
        assert!(!lo.contains(100));
        assert!(hi.contains(100));
        assert!(ChunkRange::new(0, 10).unwrap().split_at(0).is_err());
        assert_eq!(format!("{}", lo), "[MinKey, 100)");
    }
}
