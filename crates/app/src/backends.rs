//! Concrete capture and inference backends, selected by cargo features.

use std::path::PathBuf;

use anyhow::{Result, bail};
use ml_core::VehicleDetector;
use parking::{DetectorFactory, SourceFactory};
use video_ingest::FrameSource;

/// Input resolution fed to the TorchScript detector.
#[cfg_attr(not(feature = "with-tch"), allow(dead_code))]
const DETECTOR_INPUT: (i64, i64) = (640, 640);

/// Opens camera paths through OpenCV when the `opencv` feature is enabled.
pub struct SourceBackend;

impl SourceFactory for SourceBackend {
    #[cfg(feature = "opencv")]
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(video_ingest::OpenCvSource::open(uri)?))
    }

    #[cfg(not(feature = "opencv"))]
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>> {
        bail!("cannot open `{uri}`: smart-parking was built without the `opencv` feature")
    }
}

/// Builds TorchScript detectors when the `with-tch` feature is enabled.
pub struct DetectorBackend {
    model_path: Option<PathBuf>,
    #[cfg_attr(not(feature = "with-tch"), allow(dead_code))]
    confidence: f32,
}

impl DetectorBackend {
    pub fn new(model_path: Option<PathBuf>, confidence: f32) -> Self {
        Self {
            model_path,
            confidence,
        }
    }
}

impl DetectorFactory for DetectorBackend {
    #[cfg(feature = "with-tch")]
    fn available_devices(&self) -> Vec<String> {
        ml_core::detector::available_devices()
    }

    #[cfg(not(feature = "with-tch"))]
    fn available_devices(&self) -> Vec<String> {
        vec!["CPU".to_string()]
    }

    #[cfg(feature = "with-tch")]
    fn create(&self, device: &str) -> Result<Box<dyn VehicleDetector>> {
        let Some(model_path) = self.model_path.as_ref() else {
            bail!("--model is required to run the TorchScript detector");
        };
        let device = ml_core::detector::parse_device(device)?;
        let detector =
            ml_core::detector::TorchVehicleDetector::new(model_path, device, DETECTOR_INPUT)?
                .with_confidence_threshold(self.confidence);
        tracing::debug!(device = ?detector.device(), confidence = self.confidence, "TorchScript detector loaded");
        Ok(Box::new(detector))
    }

    #[cfg(not(feature = "with-tch"))]
    fn create(&self, device: &str) -> Result<Box<dyn VehicleDetector>> {
        let model = self
            .model_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        bail!(
            "cannot create a detector on {device} (model {model}): smart-parking was built without the `with-tch` feature"
        )
    }
}

#[cfg(all(test, not(feature = "opencv"), not(feature = "with-tch")))]
mod tests {
    use super::*;

    #[test]
    fn disabled_backends_fail_with_feature_hint() {
        let err = match SourceBackend.open("parking.mp4") {
            Ok(_) => panic!("source should not open"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("opencv"));

        let detectors = DetectorBackend::new(None, 0.6);
        assert_eq!(detectors.available_devices(), vec!["CPU".to_string()]);
        let err = match detectors.create("CPU") {
            Ok(_) => panic!("detector should not build"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("with-tch"));
    }
}
