use std::collections::VecDeque;

use crate::displacement::DisplacementSample;
use crate::grip_error::{GripError, GripResult};

pub const DEFAULT_HISTORY_CAPACITY: usize = 30;

/// Fixed-capacity window of the most recent samples from one finger, oldest first.
#[derive(Debug, Clone)]
pub struct FeatureHistory {
    capacity: usize,
    samples: VecDeque<DisplacementSample>,
}

impl FeatureHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, samples: VecDeque::with_capacity(capacity) }
    }

    /// Appends a sample, evicting the oldest one once the window is full.
    pub fn push(&mut self, sample: DisplacementSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The k-th most recent sample, where `k = 1` is the newest.
    pub fn recent(&self, k: usize) -> Option<&DisplacementSample> {
        if k == 0 || k > self.samples.len() {
            return None;
        }
        self.samples.get(self.samples.len() - k)
    }

    pub fn latest(&self) -> Option<&DisplacementSample> {
        self.recent(1)
    }

    /// Newest-first view over the last `n` samples, or `InsufficientHistory` if there are fewer.
    pub fn newest(&self, n: usize) -> GripResult<impl Iterator<Item = &DisplacementSample>> {
        self.require(n)?;
        Ok(self.samples.iter().rev().take(n))
    }

    pub fn require(&self, needed: usize) -> GripResult<()> {
        if self.samples.len() < needed {
            return Err(GripError::InsufficientHistory { needed, available: self.samples.len() });
        }
        Ok(())
    }

    /// All retained samples, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &DisplacementSample> {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl Default for FeatureHistory {
    fn default() -> Self {
        FeatureHistory::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}
