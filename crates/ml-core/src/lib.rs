//! Detection geometry and the vehicle detector seam.
//!
//! The TorchScript backend is compiled only with the `with-tch` feature so the
//! rest of the workspace builds without libtorch.

pub mod bbox;
pub mod detector;

pub use bbox::BBox;
pub use detector::VehicleDetector;

#[cfg(feature = "with-tch")]
pub use tch;
