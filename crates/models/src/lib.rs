//! Burn models for volumetric lesion detection.
//!
//! `Yolo3d` is a one-stage anchor-based detector over `[B, 1, D, H, W]` volumes:
//! a residual downsampling backbone, a top-down feature pyramid, and three
//! detection heads at strides 8, 16 and 32. Each head returns both its raw
//! logits (for the loss) and decoded boxes (for the loss and for inference).
//!
//! These are pure Burn modules; target assignment, losses and post-processing
//! live in the `training` crate.

pub mod blocks;
pub mod yolo3d;

pub use yolo3d::{
    Anchors, ScaleOutput, Yolo3d, Yolo3dConfig, ANCHORS_PER_SCALE, BOX_CHANNELS, DEFAULT_ANCHORS,
    STRIDES,
};
