//! Nearest-centroid + IoU matching of vehicle detections against stall boxes.

use std::collections::BTreeSet;

use ml_core::BBox;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatchThresholds {
    /// Maximum centroid distance in pixels between a detection and its nearest stall.
    pub distance: f32,
    /// Minimum IoU between a detection and its nearest stall.
    pub iou: f32,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            distance: 50.0,
            iou: 0.5,
        }
    }
}

/// Indices of the stalls confirmed by at least one detection.
///
/// Each detection votes only for its nearest stall (first minimum on ties),
/// and only when that stall is within `distance` and overlaps by at least `iou`.
pub fn match_occupancy(
    detections: &[BBox],
    stalls: &[BBox],
    thresholds: MatchThresholds,
) -> BTreeSet<usize> {
    let mut occupied = BTreeSet::new();
    if stalls.is_empty() {
        return occupied;
    }

    for detection in detections {
        let Some((nearest, distance)) = nearest_stall(detection, stalls) else {
            continue;
        };
        if distance > thresholds.distance {
            continue;
        }
        if detection.iou(&stalls[nearest]) >= thresholds.iou {
            occupied.insert(nearest);
        }
    }
    occupied
}

/// Expand matched indices into a 0/1 vector with one entry per stall.
pub fn occupancy_vector(occupied: &BTreeSet<usize>, stall_count: usize) -> Vec<u8> {
    (0..stall_count)
        .map(|idx| u8::from(occupied.contains(&idx)))
        .collect()
}

fn nearest_stall(detection: &BBox, stalls: &[BBox]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, stall) in stalls.iter().enumerate() {
        let distance = detection.centroid_distance(stall);
        match best {
            Some((_, current)) if distance >= current => {}
            _ => best = Some((idx, distance)),
        }
    }
    best
}
