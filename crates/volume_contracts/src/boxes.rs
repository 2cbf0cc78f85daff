use serde::{Deserialize, Serialize};

/// Axis-aligned 3D box in voxel units, stored as center + extent in z/y/x order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxZyx {
    pub center: [f32; 3],
    pub size: [f32; 3],
}

impl BoxZyx {
    pub fn new(center: [f32; 3], size: [f32; 3]) -> Self {
        Self { center, size }
    }

    /// Build from inclusive-exclusive corners `[z0, y0, x0]` / `[z1, y1, x1]`.
    pub fn from_corners(min: [f32; 3], max: [f32; 3]) -> Self {
        let mut center = [0.0; 3];
        let mut size = [0.0; 3];
        for axis in 0..3 {
            center[axis] = (min[axis] + max[axis]) * 0.5;
            size[axis] = max[axis] - min[axis];
        }
        Self { center, size }
    }

    pub fn min_corner(&self) -> [f32; 3] {
        [
            self.center[0] - self.size[0] * 0.5,
            self.center[1] - self.size[1] * 0.5,
            self.center[2] - self.size[2] * 0.5,
        ]
    }

    pub fn max_corner(&self) -> [f32; 3] {
        [
            self.center[0] + self.size[0] * 0.5,
            self.center[1] + self.size[1] * 0.5,
            self.center[2] + self.size[2] * 0.5,
        ]
    }

    pub fn volume(&self) -> f32 {
        self.size.iter().map(|s| s.max(0.0)).product()
    }

    pub fn is_valid(&self) -> bool {
        self.center.iter().chain(self.size.iter()).all(|v| v.is_finite())
            && self.size.iter().all(|s| *s > 0.0)
    }

    /// Whether `point` (z, y, x) lies inside the box, borders included.
    pub fn contains(&self, point: [f32; 3]) -> bool {
        let min = self.min_corner();
        let max = self.max_corner();
        (0..3).all(|axis| point[axis] >= min[axis] && point[axis] <= max[axis])
    }

    pub fn iou(&self, other: &BoxZyx) -> f32 {
        let a_min = self.min_corner();
        let a_max = self.max_corner();
        let b_min = other.min_corner();
        let b_max = other.max_corner();
        let mut inter = 1.0f32;
        for axis in 0..3 {
            let lo = a_min[axis].max(b_min[axis]);
            let hi = a_max[axis].min(b_max[axis]);
            inter *= (hi - lo).max(0.0);
        }
        let union = self.volume() + other.volume() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Rescale per axis, e.g. from network-input voxels to original-volume voxels.
    pub fn scaled(&self, factor: [f32; 3]) -> Self {
        Self {
            center: [
                self.center[0] * factor[0],
                self.center[1] * factor[1],
                self.center[2] * factor[2],
            ],
            size: [
                self.size[0] * factor[0],
                self.size[1] * factor[1],
                self.size[2] * factor[2],
            ],
        }
    }

    /// Clip corners to `[0, shape]` on every axis.
    pub fn clipped(&self, shape: [usize; 3]) -> Self {
        let mut min = self.min_corner();
        let mut max = self.max_corner();
        for axis in 0..3 {
            let limit = shape[axis] as f32;
            min[axis] = min[axis].clamp(0.0, limit);
            max[axis] = max[axis].clamp(0.0, limit);
        }
        Self::from_corners(min, max)
    }

    /// Largest extent in voxels.
    pub fn max_extent(&self) -> f32 {
        self.size.iter().copied().fold(0.0, f32::max)
    }

    /// Diameter (mm) of the sphere whose volume matches the ellipsoid inscribed in the box.
    pub fn equivalent_diameter_mm(&self, spacing_mm: [f32; 3]) -> f32 {
        let d = self.size[0].max(0.0) * spacing_mm[0];
        let h = self.size[1].max(0.0) * spacing_mm[1];
        let w = self.size[2].max(0.0) * spacing_mm[2];
        (d * h * w).cbrt()
    }
}
