//! Classification: partitions the block set into visible and not-visible.
//!
//! A block is visible when its classification statistic lies inside the
//! inclusive range `[low, high]`. Every call is a full repartition; visible
//! blocks come out most interesting first so the loader streams them first.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::cache::block::{Block, BlockId, BlockSet};

#[derive(Error, Debug, PartialEq)]
pub enum ClassificationError {
    #[error("Invalid classification range: low {low} > high {high}")]
    InvalidRange { low: f64, high: f64 },

    #[error("Unknown classification type '{0}'")]
    UnknownType(String),
}

/// Which per-block statistic drives visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ClassificationType {
    /// Normalized max - min of the block.
    #[default]
    #[serde(rename = "rov")]
    RangeOfValues,
    /// Normalized mean of the block.
    #[serde(rename = "avg")]
    Average,
}

impl ClassificationType {
    /// The statistic this type reads from `block`.
    pub fn value_of(&self, block: &Block) -> f64 {
        match self {
            ClassificationType::RangeOfValues => block.range_of_values(),
            ClassificationType::Average => block.average(),
        }
    }
}

impl fmt::Display for ClassificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassificationType::RangeOfValues => f.write_str("rov"),
            ClassificationType::Average => f.write_str("avg"),
        }
    }
}

impl FromStr for ClassificationType {
    type Err = ClassificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rov" | "range" | "range_of_values" => Ok(ClassificationType::RangeOfValues),
            "avg" | "average" => Ok(ClassificationType::Average),
            other => Err(ClassificationError::UnknownType(other.to_string())),
        }
    }
}

/// A validated inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    low: f64,
    high: f64,
}

impl ValueRange {
    pub fn new(low: f64, high: f64) -> Result<Self, ClassificationError> {
        if low.is_nan() || high.is_nan() || low > high {
            return Err(ClassificationError::InvalidRange { low, high });
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    pub fn contains(&self, value: f64) -> bool {
        self.low <= value && value <= self.high
    }
}

/// Outcome of one classification pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    /// Visible blocks, highest statistic first, ties by ascending index.
    pub visible: Vec<BlockId>,

    /// Everything else, in index order.
    pub not_visible: Vec<BlockId>,
}

impl Classification {
    /// Number of blocks shown by this classification.
    pub fn shown(&self) -> usize {
        self.visible.len()
    }

    /// Write the visibility flags onto the blocks.
    pub fn publish(&self, blocks: &BlockSet) {
        for &id in &self.visible {
            if let Some(block) = blocks.get(id) {
                block.set_visible(true);
            }
        }
        for &id in &self.not_visible {
            if let Some(block) = blocks.get(id) {
                block.set_visible(false);
            }
        }
    }
}

/// Partition `blocks` by `low <= statistic <= high`.
///
/// An inverted or NaN range matches nothing.
pub fn classify(blocks: &BlockSet, kind: ClassificationType, low: f64, high: f64) -> Classification {
    let mut visible: Vec<(BlockId, f64)> = Vec::new();
    let mut not_visible = Vec::new();

    for block in blocks.iter() {
        let value = kind.value_of(block);
        if low <= value && value <= high {
            visible.push((block.id(), value));
        } else {
            not_visible.push(block.id());
        }
    }

    visible.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });

    let classification = Classification {
        visible: visible.into_iter().map(|(id, _)| id).collect(),
        not_visible,
    };

    debug!(
        kind = %kind,
        low,
        high,
        shown = classification.shown(),
        total = blocks.len(),
        "Classified blocks"
    );

    classification
}
