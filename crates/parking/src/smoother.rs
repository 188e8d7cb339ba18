//! Sliding-window majority vote over per-frame occupancy vectors.

use std::collections::VecDeque;

/// Default number of frames kept per camera.
pub const DEFAULT_WINDOW: usize = 30;

/// Bounded history of raw occupancy vectors for one camera.
///
/// Early frames are voted over whatever is in the window, so the first few
/// outputs follow the detector closely until the window fills.
#[derive(Debug, Clone)]
pub struct TemporalSmoother {
    window: VecDeque<Vec<u8>>,
    capacity: usize,
}

impl Default for TemporalSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl TemporalSmoother {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Append a raw vector, evicting the oldest once full, and return the per-stall mode.
    pub fn push(&mut self, vector: Vec<u8>) -> Vec<u8> {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(vector);
        self.smoothed()
    }

    /// Per-stall mode over the window. Ties go to the lowest value.
    pub fn smoothed(&self) -> Vec<u8> {
        let Some(latest) = self.window.back() else {
            return Vec::new();
        };
        (0..latest.len())
            .map(|stall| {
                let mut counts = [0usize; 256];
                for vector in &self.window {
                    if let Some(value) = vector.get(stall) {
                        counts[*value as usize] += 1;
                    }
                }
                mode(&counts)
            })
            .collect()
    }
}

fn mode(counts: &[usize; 256]) -> u8 {
    let mut best = 0u8;
    let mut best_count = 0usize;
    for (value, count) in counts.iter().enumerate() {
        if *count > best_count {
            best = value as u8;
            best_count = *count;
        }
    }
    best
}
