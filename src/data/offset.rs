//! Receptive-field alignment between input and output sequences.

use std::fmt;
use std::ops::Range;

use crate::error::{CebraError, Result};

/// Number of input samples an encoder consumes on each side of one output sample.
///
/// A window for center index `i` spans `[i - left, i + right]`, so an encoder with
/// this offset turns an input of length `T` into an output of length
/// `T - (len() - 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Offset {
    left: usize,
    right: usize,
}

impl Offset {
    pub const fn new(left: usize, right: usize) -> Self {
        Self { left, right }
    }

    pub const fn left(&self) -> usize {
        self.left
    }

    pub const fn right(&self) -> usize {
        self.right
    }

    /// Window length, `left + right + 1`.
    #[allow(clippy::len_without_is_empty)]
    pub const fn len(&self) -> usize {
        self.left + self.right + 1
    }

    /// Center indices whose full window fits in a sequence of `num_samples`.
    pub fn valid_range(&self, num_samples: usize) -> Range<usize> {
        let end = num_samples.saturating_sub(self.right);
        self.left.min(end)..end
    }

    pub fn num_valid(&self, num_samples: usize) -> usize {
        num_samples.saturating_sub(self.left + self.right)
    }

    /// Fails with `InsufficientSamples` unless at least `required` centers are valid.
    pub fn ensure_valid(&self, num_samples: usize, required: usize) -> Result<()> {
        let available = self.num_valid(num_samples);
        if available < required.max(1) {
            return Err(CebraError::InsufficientSamples {
                required: required.max(1) + self.left + self.right,
                available: num_samples,
            });
        }
        Ok(())
    }
}

impl TryFrom<(i64, i64)> for Offset {
    type Error = CebraError;

    fn try_from((left, right): (i64, i64)) -> Result<Self> {
        if left < 0 || right < 0 {
            return Err(CebraError::InvalidOffset { left, right });
        }
        Ok(Self::new(left as usize, right as usize))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Offset({}, {})", self.left, self.right)
    }
}
