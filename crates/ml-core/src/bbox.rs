use serde::{Deserialize, Serialize};

/// Axis-aligned box in pixel coordinates, `(xmin, ymin)` inclusive to `(xmax, ymax)` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl BBox {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    /// Build from a centre-based `[cx, cy, w, h]` box.
    pub fn from_xywh(xywh: [f32; 4]) -> Self {
        let [cx, cy, w, h] = xywh;
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    /// Centre point truncated to whole pixels.
    pub fn centroid(&self) -> (f32, f32) {
        (
            ((self.xmin + self.xmax) / 2.0).trunc(),
            ((self.ymin + self.ymax) / 2.0).trunc(),
        )
    }

    /// Euclidean distance between the two centroids.
    pub fn centroid_distance(&self, other: &BBox) -> f32 {
        let (ax, ay) = self.centroid();
        let (bx, by) = other.centroid();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }

    /// Area counting both edges as inside the box.
    pub fn area(&self) -> f32 {
        (self.xmax - self.xmin + 1.0) * (self.ymax - self.ymin + 1.0)
    }

    /// Intersection over union using inclusive pixel edges.
    pub fn iou(&self, other: &BBox) -> f32 {
        let x_a = self.xmin.max(other.xmin);
        let y_a = self.ymin.max(other.ymin);
        let x_b = self.xmax.min(other.xmax);
        let y_b = self.ymax.min(other.ymax);

        let inter = (x_b - x_a + 1.0).max(0.0) * (y_b - y_a + 1.0).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 { 0.0 } else { inter / union }
    }

    /// Multiply every coordinate by the per-axis ratios.
    pub fn scale(&self, x_ratio: f32, y_ratio: f32) -> Self {
        Self::new(
            self.xmin * x_ratio,
            self.ymin * y_ratio,
            self.xmax * x_ratio,
            self.ymax * y_ratio,
        )
    }

    /// Integer corners for drawing.
    pub fn to_pixels(&self) -> [i32; 4] {
        [
            self.xmin.round() as i32,
            self.ymin.round() as i32,
            self.xmax.round() as i32,
            self.ymax.round() as i32,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_boxes_have_unit_iou() {
        let a = BBox::new(10.0, 10.0, 50.0, 40.0);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn disjoint_boxes_have_zero_iou() {
        let a = BBox::new(0.0, 0.0, 9.0, 9.0);
        let b = BBox::new(20.0, 20.0, 29.0, 29.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn half_overlap() {
        // Two 10x10 boxes sharing a 5x10 strip: 50 / (100 + 100 - 50).
        let a = BBox::new(0.0, 0.0, 9.0, 9.0);
        let b = BBox::new(5.0, 0.0, 14.0, 9.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn centroid_truncates() {
        let a = BBox::new(0.0, 0.0, 5.0, 3.0);
        assert_eq!(a.centroid(), (2.0, 1.0));
        let b = BBox::new(3.0, 4.0, 5.0, 6.0);
        assert_eq!(a.centroid_distance(&b), (4.0f32 + 16.0).sqrt());
    }

    #[test]
    fn xywh_conversion() {
        let b = BBox::from_xywh([50.0, 40.0, 20.0, 10.0]);
        assert_eq!(b, BBox::new(40.0, 35.0, 60.0, 45.0));
    }
}
